//! # GPU Address Types
//!
//! Strongly typed wrappers for the two address spaces a translation-table
//! manager juggles:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`GttAddress`] | An offset inside a GPU virtual address space (GGTT or PPGTT). |
//! | [`DmaAddress`] | A bus address of host memory as seen by the device. |
//! | [`GttRange`] | A half-open `[start, start + length)` span of GPU virtual addresses. |
//!
//! Mixing the two is a classic source of page-table corruption: a PTE must
//! carry a DMA address, a walker index must be derived from a GTT address.
//! Keeping them apart at the type level makes that mistake a compile error.
//!
//! ## Page Sizes
//!
//! The hardware knows three leaf granularities, modeled as marker types that
//! implement [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages (base granularity, one PTE)
//! - [`Size64K`] — 64 KiB pages (16 PTEs under an IPS-tagged PDE)
//! - [`Size2M`] — 2 MiB pages (one PDE with the page-size bit)
//!
//! ```rust
//! # use gtt_addresses::*;
//! let va = GttAddress::new(0x0020_1234);
//! assert_eq!(va.align_down::<Size2M>().as_u64(), 0x0020_0000);
//! assert!(!va.is_aligned::<Size4K>());
//!
//! let dma = DmaAddress::new(0x8000_0000);
//! assert!(dma.is_aligned::<Size2M>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod dma_address;
mod gtt_address;
mod gtt_range;
mod page_size;

pub use dma_address::DmaAddress;
pub use gtt_address::GttAddress;
pub use gtt_range::GttRange;
pub use page_size::{PageSize, Size2M, Size4K, Size64K};

/// Round `x` down to a multiple of `align` (power of two).
///
/// ```
/// # use gtt_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Round `x` up to a multiple of `align` (power of two); `None` on overflow.
///
/// ```
/// # use gtt_addresses::checked_align_up;
/// assert_eq!(checked_align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(checked_align_up(0x2000, 0x1000), Some(0x2000));
/// assert_eq!(checked_align_up(u64::MAX - 1, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of `align` (power of two).
#[inline]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}
