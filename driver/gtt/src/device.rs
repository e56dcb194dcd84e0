//! Per-device state shared by every address space of one GPU.

use crate::error::GttError;
use crate::ggtt::Ggtt;
use crate::gsm::GsmWindow;
use crate::page::PageBackend;
use crate::pool::{PageAllocator, Reclaim, ReclaimRegistry, WcPool};
use crate::space::AddressSpace;
use crate::walk::TableFormat;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use gtt_info::{DeviceInfo, GttConfig, PpgttType};
use gtt_registers::Mmio;
use gtt_sync::Rendezvous;
use log::{debug, info};

pub struct Device {
    info: DeviceInfo,
    config: GttConfig,
    backend: Arc<dyn PageBackend>,
    pool: Arc<WcPool>,
    reclaim: Arc<ReclaimRegistry>,
    awake: AtomicBool,
    rendezvous: Rendezvous,
}

impl Device {
    #[must_use]
    pub fn new(info: DeviceInfo, config: GttConfig, backend: Arc<dyn PageBackend>) -> Arc<Self> {
        let pool = Arc::new(WcPool::new(Arc::clone(&backend), config.stash_capacity));
        let reclaim = Arc::new(ReclaimRegistry::new(Arc::clone(&pool)));
        info!(
            "{} ({:#06x}): gen{}, ppgtt {:?}, {}",
            info.name,
            info.device_id,
            info.generation,
            info.effective_ppgtt(&config),
            if info.has_llc { "llc" } else { "wc page tables" }
        );
        Arc::new(Self {
            info,
            config,
            backend,
            pool,
            reclaim,
            awake: AtomicBool::new(true),
            rendezvous: Rendezvous::new(),
        })
    }

    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[must_use]
    pub const fn config(&self) -> &GttConfig {
        &self.config
    }

    #[must_use]
    pub const fn wc_pool(&self) -> &Arc<WcPool> {
        &self.pool
    }

    /// Barrier for GGTT updates under the VT-d workaround. Agents touching
    /// the aperture register here.
    #[must_use]
    pub const fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Extra memory to give back when table allocation runs dry.
    pub fn add_reclaim_hook(&self, hook: Arc<dyn Reclaim>) {
        self.reclaim.add_hook(hook);
    }

    pub fn wake(&self) {
        self.awake.store(true, Ordering::Release);
    }

    pub fn suspend(&self) {
        self.awake.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_awake(&self) -> Result<(), GttError> {
        if self.is_awake() {
            Ok(())
        } else {
            Err(GttError::DeviceAsleep)
        }
    }

    #[must_use]
    pub fn effective_ppgtt(&self) -> PpgttType {
        self.info.effective_ppgtt(&self.config)
    }

    /// Table format and size of this device's per-context address spaces.
    #[must_use]
    pub fn ppgtt_format(&self) -> Option<(TableFormat, u64)> {
        let kind = self.effective_ppgtt();
        match (kind, self.info.generation) {
            (PpgttType::None, _) | (_, 0..=5) => None,
            (PpgttType::Full48, 8..) => Some((TableFormat::FourLevel, 1 << 48)),
            (_, 8..) => Some((TableFormat::ThreeLevel, 1 << 32)),
            (_, 6..=7) => Some((TableFormat::TwoLevel, 1 << 31)),
        }
    }

    /// A per-context address space in the device's PPGTT format.
    pub fn create_ppgtt(self: &Arc<Self>) -> Result<AddressSpace, GttError> {
        let (format, total) = self.ppgtt_format().ok_or(GttError::Unsupported)?;
        AddressSpace::new(self, "ppgtt", format, total, None)
    }

    /// An address space of an explicit format and size.
    pub fn create_address_space(
        self: &Arc<Self>,
        name: &'static str,
        format: TableFormat,
        total: u64,
    ) -> Result<AddressSpace, GttError> {
        AddressSpace::new(self, name, format, total, None)
    }

    /// The global GTT over `gsm`, with the flush registers behind `mmio`.
    pub fn create_ggtt(
        self: &Arc<Self>,
        gsm: Box<dyn GsmWindow>,
        mmio: Arc<dyn Mmio>,
    ) -> Result<Ggtt, GttError> {
        Ggtt::new(self, gsm, mmio)
    }

    pub(crate) fn page_allocator(&self) -> Arc<PageAllocator> {
        let reclaim: Arc<dyn Reclaim> = self.reclaim.clone();
        let allocator = Arc::new(
            PageAllocator::new(Arc::clone(&self.backend), Arc::clone(&self.pool), !self.info.has_llc)
                .with_reclaim(reclaim),
        );
        self.reclaim.register(&allocator);
        allocator
    }

    /// Releases the shared page pool. Address spaces must be gone.
    pub fn shutdown(&self) {
        self.pool.teardown();
        debug!("{}: gtt shut down", self.info.name);
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("config", &self.config)
            .field("awake", &self.is_awake())
            .finish_non_exhaustive()
    }
}
