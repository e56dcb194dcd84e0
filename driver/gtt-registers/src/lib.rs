//! # Typed GPU MMIO Registers
//!
//! Only the handful of registers the translation-table manager touches:
//! GGTT write flush, GTT cache invalidation, and the page-fault status
//! latches. Access goes through the [`Mmio`] trait so the same types work on
//! a mapped BAR or on a simulated device.

#![cfg_attr(not(any(test, doctest)), no_std)]

#[cfg(feature = "fault")]
pub mod fault;
#[cfg(feature = "flush")]
pub mod flush;

/// Byte offset of a register inside the GPU's MMIO BAR.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmioOffset(pub u32);

impl MmioOffset {
    #[inline]
    #[must_use]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The same register in the block of another engine (`stride` bytes apart).
    #[inline]
    #[must_use]
    pub const fn engine(self, index: u32, stride: u32) -> Self {
        Self(self.0 + index * stride)
    }
}

/// 32-bit register window of a GPU.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: MmioOffset) -> u32;
    fn write32(&self, offset: MmioOffset, value: u32);

    /// Read back to make sure earlier writes have reached the device.
    #[inline]
    fn posting_read(&self, offset: MmioOffset) {
        let _ = self.read32(offset);
    }
}

/// A register at a fixed offset.
pub trait Register: Sized + Copy {
    const OFFSET: MmioOffset;

    fn from_raw(raw: u32) -> Self;
    fn into_raw(self) -> u32;
}

pub trait LoadRegister: Register {
    fn load<M: Mmio + ?Sized>(mmio: &M) -> Self;
    fn load_at<M: Mmio + ?Sized>(mmio: &M, offset: MmioOffset) -> Self;
}

pub trait StoreRegister: Register {
    fn store<M: Mmio + ?Sized>(self, mmio: &M);
    fn store_at<M: Mmio + ?Sized>(self, mmio: &M, offset: MmioOffset);
}

impl<T> LoadRegister for T
where
    T: Register,
{
    #[inline]
    fn load<M: Mmio + ?Sized>(mmio: &M) -> Self {
        Self::load_at(mmio, Self::OFFSET)
    }

    #[inline]
    fn load_at<M: Mmio + ?Sized>(mmio: &M, offset: MmioOffset) -> Self {
        Self::from_raw(mmio.read32(offset))
    }
}

impl<T> StoreRegister for T
where
    T: Register,
{
    #[inline]
    fn store<M: Mmio + ?Sized>(self, mmio: &M) {
        self.store_at(mmio, Self::OFFSET);
    }

    #[inline]
    fn store_at<M: Mmio + ?Sized>(self, mmio: &M, offset: MmioOffset) {
        mmio.write32(offset, self.into_raw());
    }
}

/// Implements [`Register`] for a `#[bitfield(u32)]` type.
macro_rules! register {
    ($ty:ty, $offset:expr) => {
        impl $crate::Register for $ty {
            const OFFSET: $crate::MmioOffset = $crate::MmioOffset::new($offset);

            #[inline]
            fn from_raw(raw: u32) -> Self {
                Self::from_bits(raw)
            }

            #[inline]
            fn into_raw(self) -> u32 {
                self.into_bits()
            }
        }
    };
}
pub(crate) use register;
