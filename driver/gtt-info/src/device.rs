//! Static per-device capabilities.

use bitflags::bitflags;
use gtt_config_derive::Setters;

bitflags! {
    /// Leaf page sizes. Each flag's value is the size in bytes, so the OR of
    /// scatter-list chunk lengths can be masked directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageSizes: u32 {
        const SIZE_4K = 1 << 12;
        const SIZE_64K = 1 << 16;
        const SIZE_2M = 1 << 21;
    }
}

impl PageSizes {
    /// `true` if anything larger than 4 KiB is present.
    #[inline]
    #[must_use]
    pub const fn has_huge(self) -> bool {
        self.intersects(Self::SIZE_64K.union(Self::SIZE_2M))
    }

    /// Largest size present, in bytes.
    #[inline]
    #[must_use]
    pub const fn largest(self) -> u64 {
        if self.is_empty() {
            0
        } else {
            1 << (31 - self.bits().leading_zeros())
        }
    }
}

bitflags! {
    /// Hardware errata affecting the GTT manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Errata: u32 {
        /// GGTT updates racing with aperture access corrupt the table while
        /// VT-d is active. Updates must run inside a stop-machine rendezvous.
        const VTD_GGTT_UPDATE = 1 << 0;
        /// The scratch page must be 64 KiB when 64 KiB leaves are in use.
        const SCRATCH_64K = 1 << 1;
        /// Huge-leaf promotion is broken on this stepping.
        const NO_HUGE_PAGES = 1 << 2;
    }
}

/// Per-process GTT flavor a device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PpgttType {
    /// No PPGTT; everything lives in the GGTT.
    None,
    /// A single PPGTT shadowing the GGTT layout.
    Aliasing,
    /// Per-context 32-bit address spaces.
    Full,
    /// Per-context 48-bit address spaces.
    Full48,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct DeviceInfo {
    /// Marketing codename.
    pub name: &'static str,
    /// PCI device id.
    pub device_id: u16,
    /// Graphics generation.
    pub generation: u8,
    /// Shares the CPU's last-level cache. Without it page-table pages must be
    /// mapped write-combined.
    pub has_llc: bool,
    /// Flavor of PPGTT the hardware implements.
    pub ppgtt: PpgttType,
    /// Leaf sizes the PPGTT walker understands.
    pub page_sizes: PageSizes,
    /// A separate GTT cache needs invalidating after GGTT updates.
    pub has_gtt_cache: bool,
    /// Known errata.
    pub errata: Errata,
}

impl DeviceInfo {
    #[must_use]
    pub const fn new(name: &'static str, device_id: u16, generation: u8) -> Self {
        Self {
            name,
            device_id,
            generation,
            has_llc: true,
            ppgtt: PpgttType::None,
            page_sizes: PageSizes::SIZE_4K,
            has_gtt_cache: false,
            errata: Errata::empty(),
        }
    }

    /// Gen8 and later PTEs have a usable RW bit.
    #[inline]
    #[must_use]
    pub const fn has_read_only(&self) -> bool {
        self.generation >= 8
    }

    /// Stop-machine GGTT updates are required.
    #[inline]
    #[must_use]
    pub const fn needs_vtd_wa(&self, config: &crate::GttConfig) -> bool {
        self.errata.contains(Errata::VTD_GGTT_UPDATE) && config.vtd_active
    }

    /// Leaf sizes usable for huge promotion under `config`.
    #[inline]
    #[must_use]
    pub const fn huge_page_sizes(&self, config: &crate::GttConfig) -> PageSizes {
        if !config.huge_pages || self.errata.contains(Errata::NO_HUGE_PAGES) {
            PageSizes::SIZE_4K
        } else {
            self.page_sizes
        }
    }

    /// Effective PPGTT flavor after the configuration and virtualization
    /// limits are applied. Configuration can only lower the capability.
    #[must_use]
    pub fn effective_ppgtt(&self, config: &crate::GttConfig) -> PpgttType {
        let mut kind = self.ppgtt;
        if let Some(requested) = config.enable_ppgtt {
            kind = kind.min(requested);
        }
        if config.virtualized && !config.vgpu_full48 && kind == PpgttType::Full48 {
            kind = PpgttType::Full;
        }
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GttConfig;

    #[test]
    fn page_sizes_from_lengths() {
        let or_of_lengths = (2 << 20) | (64 << 10) | (12 << 10);
        let sizes = PageSizes::from_bits_truncate(or_of_lengths);
        assert_eq!(sizes, PageSizes::SIZE_2M | PageSizes::SIZE_64K);
        assert_eq!(sizes.largest(), 2 << 20);
        assert!(sizes.has_huge());
        assert!(!PageSizes::SIZE_4K.has_huge());
    }

    #[test]
    fn ppgtt_override_only_lowers() {
        let info = DeviceInfo::new("test", 0, 9).with_ppgtt(PpgttType::Full);
        let up = GttConfig::new().with_enable_ppgtt(PpgttType::Full48);
        assert_eq!(info.effective_ppgtt(&up), PpgttType::Full);
        let down = GttConfig::new().with_enable_ppgtt(PpgttType::Aliasing);
        assert_eq!(info.effective_ppgtt(&down), PpgttType::Aliasing);
    }

    #[test]
    fn vgpu_without_full48_is_limited() {
        let info = DeviceInfo::new("test", 0, 9).with_ppgtt(PpgttType::Full48);
        let vgpu = GttConfig::new().with_virtualized(true);
        assert_eq!(info.effective_ppgtt(&vgpu), PpgttType::Full);
        let vgpu48 = vgpu.with_vgpu_full48(true);
        assert_eq!(info.effective_ppgtt(&vgpu48), PpgttType::Full48);
    }

    #[test]
    fn huge_pages_respect_errata_and_config() {
        let info = DeviceInfo::new("test", 0, 9)
            .with_page_sizes(PageSizes::all());
        assert_eq!(info.huge_page_sizes(&GttConfig::new()), PageSizes::all());
        assert_eq!(
            info.huge_page_sizes(&GttConfig::new().with_huge_pages(false)),
            PageSizes::SIZE_4K
        );
        let broken = info.with_errata(Errata::NO_HUGE_PAGES);
        assert_eq!(broken.huge_page_sizes(&GttConfig::new()), PageSizes::SIZE_4K);
    }
}
