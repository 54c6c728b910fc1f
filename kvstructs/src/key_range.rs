use crate::Key;

/// A range of internal keys, `[left, right]`.
///
/// An empty range (neither bound set and not infinite) is used as "no constraint yet":
/// as a receiver it overlaps with everything, as an argument it overlaps with nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyRange {
    left: Key,
    right: Key,
    inf: bool,
}

impl KeyRange {
    /// Returns a range covering `[left, right]`.
    #[inline]
    pub fn new(left: Key, right: Key) -> Self {
        Self {
            left,
            right,
            inf: false,
        }
    }

    /// Returns the range covering every key.
    #[inline]
    pub fn inf() -> Self {
        Self {
            left: Key::new(),
            right: Key::new(),
            inf: true,
        }
    }

    /// Returns the left bound.
    #[inline]
    pub const fn start(&self) -> &Key {
        &self.left
    }

    /// Returns the right bound.
    #[inline]
    pub const fn end(&self) -> &Key {
        &self.right
    }

    /// Sets the left bound.
    #[inline]
    pub fn set_start(&mut self, left: Key) {
        self.left = left;
    }

    /// Sets the right bound.
    #[inline]
    pub fn set_end(&mut self, right: Key) {
        self.right = right;
    }

    /// Returns true if the range is infinite.
    #[inline]
    pub const fn is_inf(&self) -> bool {
        self.inf
    }

    /// Returns the key range is empty or not.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty() && !self.inf
    }

    /// Extends the range so that it also covers `kr`.
    pub fn extend(&mut self, kr: &KeyRange) {
        if kr.is_empty() {
            return;
        }

        if self.is_empty() {
            *self = kr.clone();
            return;
        }

        if self.left.is_empty() || kr.left < self.left {
            self.left = kr.left.clone();
        }

        if self.right.is_empty() || kr.right > self.right {
            self.right = kr.right.clone();
        }

        if kr.inf {
            self.inf = true;
        }
    }

    /// Returns the key range overlaps with other key range.
    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        // Empty keyRange always overlaps.
        if self.is_empty() {
            return true;
        }

        // Empty dst doesn't overlap with anything.
        if other.is_empty() {
            return false;
        }

        if self.inf || other.inf {
            return true;
        }

        // [other.left, other.right] ... [self.left, self.right]
        if self.left > other.right {
            return false;
        }

        // [self.left, self.right] ... [other.left, other.right]
        if self.right < other.left {
            return false;
        }

        true
    }
}

impl core::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.inf {
            return write!(f, "[inf]");
        }
        write!(
            f,
            "[left={:?}@{}, right={:?}@{}]",
            String::from_utf8_lossy(self.left.parse_key()),
            self.left.parse_timestamp(),
            String::from_utf8_lossy(self.right.parse_key()),
            self.right.parse_timestamp(),
        )
    }
}
