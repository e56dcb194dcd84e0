//! GGTT write-combining flush and GTT cache invalidation.
//!
//! PTE writes through the aperture are posted in the CPU's write-combining
//! buffer. Writing the flush control register drains it; on parts with a
//! separate GTT cache a second write invalidates that cache.

use crate::register;
use bitfield_struct::bitfield;

/// `GFX_FLSH_CNTL_GEN6` — flush pending GGTT writes.
#[bitfield(u32)]
pub struct GfxFlushControl {
    /// Bit 0 — write 1 to flush.
    pub enable: bool,

    #[bits(31)]
    __: u32,
}

register!(GfxFlushControl, 0x0010_1008);

impl GfxFlushControl {
    #[inline]
    #[must_use]
    pub const fn flush() -> Self {
        Self::new().with_enable(true)
    }
}

/// `GEN8_GTCR` — GTT cache control.
#[bitfield(u32)]
pub struct GtCacheControl {
    /// Bit 0 — write 1 to invalidate every cached translation.
    pub invalidate: bool,

    #[bits(31)]
    __: u32,
}

register!(GtCacheControl, 0x4274);

impl GtCacheControl {
    #[inline]
    #[must_use]
    pub const fn invalidate_all() -> Self {
        Self::new().with_invalidate(true)
    }
}
