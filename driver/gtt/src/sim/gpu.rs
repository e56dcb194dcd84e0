use crate::gsm::GsmWindow;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use gtt_registers::fault::{FaultTlbData0, FaultTlbData1, RingFault};
use gtt_registers::flush::{GfxFlushControl, GtCacheControl};
use gtt_registers::{Mmio, MmioOffset, Register};
use gtt_sync::SpinLock;

struct Table {
    /// What the GPU walker sees.
    committed: Vec<u64>,
    /// CPU writes still sitting in write-combining buffers.
    pending: BTreeMap<u64, u64>,
    /// Entries the GPU has cached.
    cache: BTreeMap<u64, u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    flushes: u64,
    cache_invalidations: u64,
}

/// A GPU reduced to its GGTT and a register file.
pub struct SimulatedGpu {
    regs: SpinLock<BTreeMap<u32, u32>>,
    table: SpinLock<Table>,
    counters: SpinLock<Counters>,
    gtt_cache: bool,
}

impl SimulatedGpu {
    #[must_use]
    pub fn new(entries: usize, gtt_cache: bool) -> Arc<Self> {
        Arc::new(Self {
            regs: SpinLock::new(BTreeMap::new()),
            table: SpinLock::new(Table {
                committed: vec![0; entries],
                pending: BTreeMap::new(),
                cache: BTreeMap::new(),
            }),
            counters: SpinLock::new(Counters::default()),
            gtt_cache,
        })
    }

    /// A window onto this GPU's GGTT.
    #[must_use]
    pub fn gsm(self: &Arc<Self>) -> alloc::boxed::Box<dyn GsmWindow> {
        alloc::boxed::Box::new(SimGsm {
            gpu: Arc::clone(self),
        })
    }

    /// The entry the GPU would use for `index` right now.
    #[must_use]
    pub fn device_read(&self, index: u64) -> u64 {
        let mut table = self.table.lock();
        if let Some(&cached) = table.cache.get(&index) {
            return cached;
        }
        let value = usize::try_from(index)
            .ok()
            .and_then(|i| table.committed.get(i))
            .copied()
            .unwrap_or(0);
        if self.gtt_cache {
            table.cache.insert(index, value);
        }
        value
    }

    /// Writes to the flush register so far.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.counters.with_lock(|c| c.flushes)
    }

    #[must_use]
    pub fn cache_invalidations(&self) -> u64 {
        self.counters.with_lock(|c| c.cache_invalidations)
    }

    /// GGTT writes not yet visible to the GPU.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.table.with_lock(|t| t.pending.len())
    }

    /// Latches a gen8-style fault at `address`.
    pub fn inject_fault(&self, address: u64, ggtt: bool, source_id: u8, fault_type: u8, engine: u8) {
        #[allow(clippy::cast_possible_truncation)]
        let data0 = FaultTlbData0::new().with_vaddr_43_12((address >> 12) as u32);
        #[allow(clippy::cast_possible_truncation)]
        let data1 = FaultTlbData1::new()
            .with_vaddr_47_44(((address >> 44) & 0xf) as u8)
            .with_ggtt(ggtt);
        let ring = RingFault::new()
            .with_valid(true)
            .with_fault_type(fault_type)
            .with_source_id(source_id);
        let ring = ring.into_bits() | (u32::from(engine & 0x7) << 12);
        self.regs.with_lock(|r| {
            r.insert(RingFault::OFFSET.raw(), ring);
            r.insert(FaultTlbData0::OFFSET.raw(), data0.into_bits());
            r.insert(FaultTlbData1::OFFSET.raw(), data1.into_bits());
        });
    }

    /// Latches a gen6-style fault on one engine's register.
    pub fn inject_gen6_fault(&self, engine: u32, address: u64, ggtt: bool, fault_type: u8) {
        let ring = RingFault::new()
            .with_valid(true)
            .with_fault_type(fault_type)
            .with_ggtt(ggtt);
        #[allow(clippy::cast_possible_truncation)]
        let raw = ring.into_bits() | ((address as u32) & !0xfff);
        self.regs
            .with_lock(|r| r.insert(RingFault::gen6_offset(engine).raw(), raw));
    }

    fn write_entry(&self, index: u64, entry: u64) {
        self.table.with_lock(|t| t.pending.insert(index, entry));
    }

    fn read_entry(&self, index: u64) -> u64 {
        self.table.with_lock(|t| {
            t.pending.get(&index).copied().unwrap_or_else(|| {
                usize::try_from(index)
                    .ok()
                    .and_then(|i| t.committed.get(i))
                    .copied()
                    .unwrap_or(0)
            })
        })
    }

    fn entries(&self) -> u64 {
        self.table.with_lock(|t| t.committed.len() as u64)
    }

    fn commit(&self) {
        self.table.with_lock(|t| {
            let pending = core::mem::take(&mut t.pending);
            for (index, entry) in pending {
                if let Some(slot) = usize::try_from(index).ok().and_then(|i| t.committed.get_mut(i)) {
                    *slot = entry;
                }
            }
        });
    }
}

impl Mmio for SimulatedGpu {
    fn read32(&self, offset: MmioOffset) -> u32 {
        self.regs
            .with_lock(|r| r.get(&offset.raw()).copied().unwrap_or(0))
    }

    fn write32(&self, offset: MmioOffset, value: u32) {
        if offset == GfxFlushControl::OFFSET && GfxFlushControl::from_raw(value).enable() {
            self.commit();
            self.counters.with_lock(|c| c.flushes += 1);
        } else if offset == GtCacheControl::OFFSET && GtCacheControl::from_raw(value).invalidate() {
            self.table.with_lock(|t| t.cache.clear());
            self.counters.with_lock(|c| c.cache_invalidations += 1);
        }
        self.regs.with_lock(|r| r.insert(offset.raw(), value));
    }
}

/// [`GsmWindow`] over a [`SimulatedGpu`].
pub struct SimGsm {
    gpu: Arc<SimulatedGpu>,
}

impl GsmWindow for SimGsm {
    fn entries(&self) -> u64 {
        self.gpu.entries()
    }

    fn write_entry(&mut self, index: u64, entry: u64) {
        self.gpu.write_entry(index, entry);
    }

    fn read_entry(&self, index: u64) -> u64 {
        self.gpu.read_entry(index)
    }
}
