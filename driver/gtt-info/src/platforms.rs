//! Device database.
//!
//! | Platform | Gen | PPGTT | LLC | Leaf sizes | Errata |
//! |----------|-----|-------|-----|------------|--------|
//! | Sandybridge | 6 | aliasing | yes | 4K | |
//! | Ivybridge | 7 | full (2-level) | yes | 4K | |
//! | Broadwell | 8 | full 48-bit | yes | 4K, 2M | |
//! | Cherryview | 8 | full 32-bit | no | 4K | |
//! | Skylake | 9 | full 48-bit | yes | 4K, 64K, 2M | |
//! | Broxton | 9 | full 48-bit | no | 4K, 64K, 2M | VT-d GGTT update |
//! | Kabylake | 9 | full 48-bit | yes | 4K, 64K, 2M | |

use crate::{DeviceInfo, Errata, PageSizes, PpgttType};

pub const SANDYBRIDGE: DeviceInfo = DeviceInfo::new("sandybridge", 0x0126, 6)
    .with_ppgtt(PpgttType::Aliasing);

pub const IVYBRIDGE: DeviceInfo = DeviceInfo::new("ivybridge", 0x0166, 7)
    .with_ppgtt(PpgttType::Full);

pub const BROADWELL: DeviceInfo = DeviceInfo::new("broadwell", 0x1616, 8)
    .with_ppgtt(PpgttType::Full48)
    .with_page_sizes(PageSizes::SIZE_4K.union(PageSizes::SIZE_2M));

pub const CHERRYVIEW: DeviceInfo = DeviceInfo::new("cherryview", 0x22b0, 8)
    .with_has_llc(false)
    .with_ppgtt(PpgttType::Full);

pub const SKYLAKE: DeviceInfo = DeviceInfo::new("skylake", 0x1916, 9)
    .with_ppgtt(PpgttType::Full48)
    .with_page_sizes(PageSizes::all());

pub const BROXTON: DeviceInfo = DeviceInfo::new("broxton", 0x5a84, 9)
    .with_has_llc(false)
    .with_ppgtt(PpgttType::Full48)
    .with_page_sizes(PageSizes::all())
    .with_errata(Errata::VTD_GGTT_UPDATE);

pub const KABYLAKE: DeviceInfo = DeviceInfo::new("kabylake", 0x5916, 9)
    .with_ppgtt(PpgttType::Full48)
    .with_page_sizes(PageSizes::all());

pub const ALL: &[DeviceInfo] = &[
    SANDYBRIDGE,
    IVYBRIDGE,
    BROADWELL,
    CHERRYVIEW,
    SKYLAKE,
    BROXTON,
    KABYLAKE,
];

/// Look a device up by PCI id.
#[must_use]
pub fn lookup(device_id: u16) -> Option<&'static DeviceInfo> {
    ALL.iter().find(|d| d.device_id == device_id)
}
