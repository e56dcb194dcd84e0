//! Page-fault status latches.
//!
//! On gen8+ a single `RING_FAULT` register latches the first fault; the
//! faulting address lives in two TLB data registers. Earlier generations
//! keep one fault register per engine with the page address in bits 31:12.

use crate::{MmioOffset, register};
use bitfield_struct::bitfield;
use gtt_addresses::GttAddress;

/// Stride between per-engine fault registers on gen6/7.
pub const GEN6_ENGINE_STRIDE: u32 = 0x100;

/// `RING_FAULT_REG` / `GEN8_RING_FAULT_REG`.
#[bitfield(u32)]
pub struct RingFault {
    /// Bit 0 — a fault is latched. Write 0 to clear.
    pub valid: bool,

    /// Bits 1–2 — fault type (page not present, write to read-only, ...).
    #[bits(2)]
    pub fault_type: u8,

    /// Bits 3–10 — requesting unit.
    #[bits(8)]
    pub source_id: u8,

    /// Bit 11 — the access went through the GGTT (gen6/7 only).
    pub ggtt: bool,

    /// Bits 12–31 — gen6/7: faulting page number. gen8+: bits 12–14 hold the
    /// engine id.
    #[bits(20)]
    page: u32,
}

register!(RingFault, 0x4094);

impl RingFault {
    /// Register of engine `hw_id` on gen6/7.
    #[inline]
    #[must_use]
    pub const fn gen6_offset(hw_id: u32) -> MmioOffset {
        MmioOffset::new(0x4094).engine(hw_id, GEN6_ENGINE_STRIDE)
    }

    /// Faulting address as reported by gen6/7.
    #[inline]
    #[must_use]
    pub const fn gen6_address(&self) -> GttAddress {
        GttAddress::new((self.page() as u64) << 12)
    }

    /// Engine id as reported by gen8+.
    #[inline]
    #[must_use]
    pub const fn gen8_engine(&self) -> u8 {
        (self.page() & 0x7) as u8
    }

    /// The same value with the valid latch dropped.
    #[inline]
    #[must_use]
    pub const fn cleared(self) -> Self {
        self.with_valid(false)
    }
}

/// `GEN8_FAULT_TLB_DATA0` — faulting virtual address bits 43:12.
#[bitfield(u32)]
pub struct FaultTlbData0 {
    pub vaddr_43_12: u32,
}

register!(FaultTlbData0, 0x4b10);

/// `GEN8_FAULT_TLB_DATA1` — address bits 47:44 and the GGTT selector.
#[bitfield(u32)]
pub struct FaultTlbData1 {
    #[bits(4)]
    pub vaddr_47_44: u8,

    /// Bit 4 — the access went through the GGTT.
    pub ggtt: bool,

    #[bits(27)]
    __: u32,
}

register!(FaultTlbData1, 0x4b14);

/// Reassemble the 48-bit faulting address from both TLB data registers.
#[inline]
#[must_use]
pub const fn gen8_fault_address(data0: FaultTlbData0, data1: FaultTlbData1) -> GttAddress {
    GttAddress::new(((data1.vaddr_47_44() as u64) << 44) | ((data0.vaddr_43_12() as u64) << 12))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Register;

    #[test]
    fn ring_fault_fields() {
        // valid, type 2, source 0x1f, ggtt, page 0x12345
        let raw = 1 | (2 << 1) | (0x1f << 3) | (1 << 11) | (0x12345 << 12);
        let f = RingFault::from_raw(raw);
        assert!(f.valid());
        assert_eq!(f.fault_type(), 2);
        assert_eq!(f.source_id(), 0x1f);
        assert!(f.ggtt());
        assert_eq!(f.gen6_address().as_u64(), 0x1234_5000);
        assert_eq!(f.gen8_engine(), 5);
        assert!(!f.cleared().valid());
        assert_eq!(f.cleared().into_raw(), raw & !1);
    }

    #[test]
    fn per_engine_offsets() {
        assert_eq!(RingFault::gen6_offset(0).raw(), 0x4094);
        assert_eq!(RingFault::gen6_offset(2).raw(), 0x4294);
    }

    #[test]
    fn address_assembly() {
        let d0 = FaultTlbData0::from_raw(0xdead_b);
        let d1 = FaultTlbData1::from_raw(0x1 | (1 << 4));
        assert!(d1.ggtt());
        assert_eq!(
            gen8_fault_address(d0, d1).as_u64(),
            (1 << 44) | (0xdead_b << 12)
        );
    }
}
