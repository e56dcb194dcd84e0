use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// An offset inside a GPU virtual address space.
///
/// GTT addresses are always relative to the address space they belong to;
/// the same value denotes unrelated memory in two different PPGTTs.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GttAddress(u64);

impl GttAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Round up to the next boundary of `S`; `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_align_up<S: PageSize>(self) -> Option<Self> {
        match self.0.checked_add(S::SIZE - 1) {
            Some(v) => Some(Self(v & !(S::SIZE - 1))),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Index of the page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page_index<S: PageSize>(self) -> u64 {
        self.0 >> S::SHIFT
    }
}

impl fmt::Debug for GttAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GttAddress({:#014x})", self.0)
    }
}

impl fmt::Display for GttAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

impl From<u64> for GttAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GttAddress> for u64 {
    #[inline]
    fn from(value: GttAddress) -> Self {
        value.0
    }
}

impl Add<u64> for GttAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for GttAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for GttAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
