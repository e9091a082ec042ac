//! Remembers the start cells of a channel's recent events, whose cells may still carry spikes.
/// Start cells of the most recent events of one channel, newest first.
///
/// A fixed-capacity ring: pushing onto a full history overwrites the oldest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCellHistory {
    cells: Vec<i32>,
    /// Slot the next push writes to.
    head: usize,
    len: usize,
}

impl StartCellHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, start_cell: i32) {
        let capacity = self.capacity();
        if let Some(slot) = self.cells.get_mut(self.head) {
            *slot = start_cell;
            self.head = (self.head + 1) % capacity;
            self.len = (self.len + 1).min(capacity);
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Iterates from the most recent start cell to the oldest one retained.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        let capacity = self.capacity();
        (1..=self.len).filter_map(move |back| {
            self.cells
                .get((self.head + capacity - back) % capacity)
                .copied()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_entries() {
        let mut history = StartCellHistory::new(3);
        assert!(history.is_empty());
        history.push(10);
        history.push(20);
        assert_eq!(history.iter().collect::<Vec<_>>(), vec![20, 10]);
        history.push(30);
        history.push(40);
        history.push(50);
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().collect::<Vec<_>>(), vec![50, 40, 30]);
        history.clear();
        assert_eq!(history.iter().count(), 0);
    }

    #[test]
    fn zero_capacity_holds_nothing() {
        let mut history = StartCellHistory::new(0);
        history.push(5);
        assert!(history.is_empty());
        assert_eq!(history.iter().count(), 0);
    }
}
