//! Maps positions within an event's read-out window onto physical cells of the ring buffer.
//!
//! Sample `i` of an event whose read-out began at `start_cell` was stored in cell
//! `(start_cell + i) mod ring_size`. Both arguments may be negative or exceed the ring,
//! the result is always normalised into `[0, ring_size)`.
use cherenkov_common::CellIndex;
use std::num::NonZeroUsize;

/// Returns the physical cell which stored sample `sample_index` of an event starting at `start_cell`.
#[inline]
pub fn physical_cell(start_cell: i64, sample_index: i64, ring_size: NonZeroUsize) -> CellIndex {
    let ring = ring_size.get() as i128;
    (i128::from(start_cell) + i128::from(sample_index)).rem_euclid(ring) as CellIndex
}

/// Returns the sample index in `[0, ring_size)` at which `cell` is read out by an event starting at `start_cell`.
///
/// This is the inverse of [physical_cell] for indices inside one turn of the ring.
#[inline]
pub fn logical_position(start_cell: i64, cell: i64, ring_size: NonZeroUsize) -> usize {
    let ring = ring_size.get() as i128;
    (i128::from(cell) - i128::from(start_cell)).rem_euclid(ring) as usize
}

/// The physical cells visited by the first `len` samples of an event starting at `start_cell`.
pub fn cells(
    start_cell: i64,
    len: usize,
    ring_size: NonZeroUsize,
) -> impl Iterator<Item = CellIndex> {
    (0..len as i64).map(move |i| physical_cell(start_cell, i, ring_size))
}
