use crate::{Key, Value};

/// Cursor over internal keys in sorted order.
///
/// The cursor starts unpositioned, call [`Iterator::rewind`] or [`Iterator::seek`]
/// before reading from it.
pub trait Iterator {
    /// advance to next
    fn next(&mut self);

    /// Moves to the first entry.
    fn rewind(&mut self);

    /// seek will reset iterator and seek to >= key.
    fn seek(&mut self, key: &[u8]);

    /// Returns the key of current position
    fn key(&self) -> Option<&Key>;

    /// Returns the value of current position
    fn val(&self) -> Option<&Value>;

    /// Returns if the current position has a valid value.
    #[inline]
    fn valid(&self) -> bool {
        self.key().is_some()
    }
}

impl<I: Iterator + ?Sized> Iterator for Box<I> {
    #[inline]
    fn next(&mut self) {
        (**self).next()
    }

    #[inline]
    fn rewind(&mut self) {
        (**self).rewind()
    }

    #[inline]
    fn seek(&mut self, key: &[u8]) {
        (**self).seek(key)
    }

    #[inline]
    fn key(&self) -> Option<&Key> {
        (**self).key()
    }

    #[inline]
    fn val(&self) -> Option<&Value> {
        (**self).val()
    }

    #[inline]
    fn valid(&self) -> bool {
        (**self).valid()
    }
}
