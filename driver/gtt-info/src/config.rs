//! Runtime configuration chosen at driver load.

use crate::{PAGEVEC_SIZE, PpgttType};
use gtt_config_derive::Setters;

/// Default GGTT span when the caller does not size the table from the GSM.
pub const DEFAULT_GGTT_SIZE: u64 = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct GttConfig {
    /// Caps the PPGTT flavor (module-parameter style). `None` uses whatever
    /// the device supports.
    #[setters(strip_option)]
    pub enable_ppgtt: Option<PpgttType>,
    /// An IOMMU is translating GPU DMA.
    pub vtd_active: bool,
    /// Running as a virtual GPU under a hypervisor.
    pub virtualized: bool,
    /// The hypervisor exposes 48-bit PPGTT to the guest.
    pub vgpu_full48: bool,
    /// GGTT span in bytes for locally backed tables.
    pub ggtt_size: u64,
    /// Pages kept per stash before surplus is drained.
    pub stash_capacity: usize,
    /// Allow 64 KiB / 2 MiB leaf promotion.
    pub huge_pages: bool,
}

impl GttConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enable_ppgtt: None,
            vtd_active: false,
            virtualized: false,
            vgpu_full48: false,
            ggtt_size: DEFAULT_GGTT_SIZE,
            stash_capacity: PAGEVEC_SIZE,
            huge_pages: true,
        }
    }
}

impl Default for GttConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_const() {
        const CFG: GttConfig = GttConfig::new()
            .with_vtd_active(true)
            .with_stash_capacity(4)
            .with_enable_ppgtt(PpgttType::Full);
        assert!(CFG.vtd_active);
        assert_eq!(CFG.stash_capacity, 4);
        assert_eq!(CFG.enable_ppgtt, Some(PpgttType::Full));
        assert_eq!(GttConfig::default().stash_capacity, PAGEVEC_SIZE);
    }

    #[test]
    fn set_in_place() {
        let mut cfg = GttConfig::new();
        cfg.set_huge_pages(false).set_ggtt_size(64 << 20);
        assert!(!cfg.huge_pages);
        assert_eq!(cfg.ggtt_size, 64 << 20);
    }
}
