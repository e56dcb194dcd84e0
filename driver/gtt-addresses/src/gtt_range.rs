use crate::{GttAddress, PageSize};
use core::fmt;

/// A half-open span `[start, start + length)` of GPU virtual addresses.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GttRange {
    start: GttAddress,
    length: u64,
}

impl GttRange {
    #[inline]
    #[must_use]
    pub const fn new(start: GttAddress, length: u64) -> Self {
        Self { start, length }
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(start: u64, length: u64) -> Self {
        Self::new(GttAddress::new(start), length)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> GttAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.length
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Exclusive end address. Saturates instead of wrapping.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> GttAddress {
        GttAddress::new(self.start.as_u64().saturating_add(self.length))
    }

    /// `true` if start and length are both multiples of `S`.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(&self) -> bool {
        self.start.is_aligned::<S>() && self.length & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: GttAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.as_u64() < other.end().as_u64()
            && other.start.as_u64() < self.end().as_u64()
    }

    /// `true` if `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub const fn encloses(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64() && other.end().as_u64() <= self.end().as_u64()
    }
}

impl fmt::Debug for GttRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GttRange({}..{})", self.start, self.end())
    }
}

impl fmt::Display for GttRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}
