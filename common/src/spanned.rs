//! Carries the span that was current when a work item was created into a [rayon] worker.
//!
//! [rayon]: https://docs.rs/rayon
use std::ops::{Deref, DerefMut};
use tracing::Span;

/// Implemented by types which own a [Span].
pub trait Spanned {
    fn span(&self) -> &Span;
}

/// Wraps a value together with a [Span], so that work done on the value on another thread
/// can be entered into the span it logically belongs to.
#[derive(Debug)]
pub struct SpanWrapper<T> {
    span: Span,
    value: T,
}

impl<T> SpanWrapper<T> {
    pub fn new(span: Span, value: T) -> Self {
        Self { span, value }
    }

    /// Wraps `value` in the span which is current on the calling thread.
    pub fn new_with_current(value: T) -> Self {
        Self::new(Span::current(), value)
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Spanned for SpanWrapper<T> {
    fn span(&self) -> &Span {
        &self.span
    }
}

impl<T> Deref for SpanWrapper<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for SpanWrapper<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_derefs_to_value() {
        let mut wrapped = SpanWrapper::new_with_current(vec![1, 2, 3]);
        wrapped.push(4);
        assert_eq!(wrapped.len(), 4);
        assert_eq!(wrapped.into_inner(), vec![1, 2, 3, 4]);
    }
}
