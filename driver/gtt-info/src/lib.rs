//! # Device Descriptions and GTT Configuration
//!
//! The authoritative source for "what can this GPU do" and "how should the
//! translation-table manager behave on it". Two kinds of data live here:
//!
//! ### Device information ([`device`], [`platforms`])
//! Static, per-part facts: generation, PPGTT flavor, LLC presence, supported
//! leaf sizes and known errata. Erratum predicates are table data keyed by
//! device id, never derived at runtime.
//!
//! ### Runtime configuration ([`config`])
//! Knobs chosen at driver load: PPGTT override, whether an IOMMU is active,
//! virtualization mode, GGTT span, stash sizing, huge-page enablement.
//!
//! ## Address-space format selection
//!
//! ```text
//!   generation >= 8, Full48, not a 32-bit vGPU ──► FourLevel  (2^48)
//!   generation >= 8, otherwise                ──► ThreeLevel (2^32)
//!   generation 6/7                            ──► TwoLevel   (2^31)
//!   no PPGTT                                  ──► GGTT only
//! ```
//!
//! ```rust
//! # use gtt_info::*;
//! let skl = platforms::lookup(0x1916).unwrap();
//! assert_eq!(skl.generation, 9);
//! assert!(skl.page_sizes.contains(PageSizes::SIZE_64K));
//!
//! let cfg = GttConfig::new().with_vtd_active(true);
//! let bxt = platforms::BROXTON;
//! assert!(bxt.needs_vtd_wa(&cfg));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod config;
pub mod device;
pub mod platforms;

pub use config::GttConfig;
pub use device::{DeviceInfo, Errata, PageSizes, PpgttType};

/// Entries per gen8 page table, page directory and PDP.
pub const GEN8_ENTRIES: usize = 512;

/// Entries per gen6/7 page table.
pub const GEN6_PTES: usize = 1024;

/// PDEs in a gen6/7 page directory.
pub const GEN6_PDES: usize = 512;

/// Default page-stash capacity (one page vector).
pub const PAGEVEC_SIZE: usize = 15;

const _: () = {
    assert!(GEN8_ENTRIES * 8 == 4096);
    assert!(GEN6_PTES * 4 == 4096);
};
