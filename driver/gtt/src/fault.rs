//! Decoding of GPU page faults latched in MMIO.

use alloc::vec::Vec;
use gtt_addresses::GttAddress;
use gtt_registers::fault::{FaultTlbData0, FaultTlbData1, RingFault, gen8_fault_address};
use gtt_registers::{LoadRegister, Mmio, StoreRegister};
use log::error;

/// Engines with their own fault register before gen8.
const GEN6_ENGINES: u32 = 4;

/// One latched GPU page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("GPU page fault at {address} (ggtt: {ggtt}) engine {engine}, source {source_id:#x}, type {fault_type}")]
pub struct DeviceFault {
    pub address: GttAddress,
    pub ggtt: bool,
    pub source_id: u8,
    pub fault_type: u8,
    pub engine: u8,
}

/// Reads, logs and clears every latched fault.
pub fn check_faults<M: Mmio + ?Sized>(mmio: &M, generation: u8) -> Vec<DeviceFault> {
    let mut faults = Vec::new();
    if generation >= 8 {
        let ring = RingFault::load(mmio);
        if ring.valid() {
            let data1 = FaultTlbData1::load(mmio);
            faults.push(DeviceFault {
                address: gen8_fault_address(FaultTlbData0::load(mmio), data1),
                ggtt: data1.ggtt(),
                source_id: ring.source_id(),
                fault_type: ring.fault_type(),
                engine: ring.gen8_engine(),
            });
            ring.cleared().store(mmio);
        }
    } else {
        for engine in 0..GEN6_ENGINES {
            let offset = RingFault::gen6_offset(engine);
            let ring = RingFault::load_at(mmio, offset);
            if !ring.valid() {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            faults.push(DeviceFault {
                address: ring.gen6_address(),
                ggtt: ring.ggtt(),
                source_id: ring.source_id(),
                fault_type: ring.fault_type(),
                engine: engine as u8,
            });
            ring.cleared().store_at(mmio, offset);
        }
    }
    for fault in &faults {
        error!("{fault}");
    }
    faults
}
