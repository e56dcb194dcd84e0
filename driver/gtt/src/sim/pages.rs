use crate::page::{DmaPage, PageBackend};
use gtt_addresses::{DmaAddress, checked_align_up};
use gtt_sync::SpinLock;
use log::trace;

/// Counters kept by [`HostPages`]. Page counts are in 4 KiB units.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    /// Allocated and not yet freed.
    pub outstanding: u64,
    pub allocations: u64,
    pub frees: u64,
    /// Allocation attempts refused by the limit.
    pub refused: u64,
    /// Calls to `set_pages_wc`.
    pub wc_batches: u64,
    /// Currently write-combined.
    pub wc_pages: u64,
    pub wb_conversions: u64,
}

struct HostState {
    next_dma: u64,
    limit: Option<u64>,
    fail_wc: bool,
    stats: HostStats,
}

/// Heap-backed [`PageBackend`] with a bump-allocated DMA address space and
/// an optional page limit.
pub struct HostPages {
    state: SpinLock<HostState>,
}

impl HostPages {
    /// First DMA address handed out. Well above zero so that a zero PTE
    /// never looks like a mapping.
    pub const DMA_BASE: u64 = 0x1_0000_0000;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(HostState {
                next_dma: Self::DMA_BASE,
                limit: None,
                fail_wc: false,
                stats: HostStats {
                    outstanding: 0,
                    allocations: 0,
                    frees: 0,
                    refused: 0,
                    wc_batches: 0,
                    wc_pages: 0,
                    wb_conversions: 0,
                },
            }),
        }
    }

    /// At most `pages` 4 KiB pages outstanding at once.
    #[must_use]
    pub fn with_limit(pages: u64) -> Self {
        let host = Self::new();
        host.set_limit(Some(pages));
        host
    }

    pub fn set_limit(&self, pages: Option<u64>) {
        self.state.with_lock(|s| s.limit = pages);
    }

    /// Makes every subsequent WC conversion fail.
    pub fn fail_wc_conversion(&self, fail: bool) {
        self.state.with_lock(|s| s.fail_wc = fail);
    }

    #[must_use]
    pub fn stats(&self) -> HostStats {
        self.state.with_lock(|s| s.stats)
    }
}

impl Default for HostPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBackend for HostPages {
    fn alloc_pages(&self, order: u8) -> Option<DmaPage> {
        let count = 1u64 << order;
        let dma = self.state.with_lock(|s| {
            if s.limit.is_some_and(|limit| s.stats.outstanding + count > limit) {
                s.stats.refused += 1;
                return None;
            }
            let size = count * crate::PAGE_SIZE;
            let dma = checked_align_up(s.next_dma, size)?;
            s.next_dma = dma + size;
            s.stats.outstanding += count;
            s.stats.allocations += 1;
            Some(dma)
        })?;
        trace!("host: allocated order-{order} page at {dma:#x}");
        Some(DmaPage::new(DmaAddress::new(dma), order))
    }

    fn free_pages(&self, page: DmaPage) {
        debug_assert!(
            !page.is_write_combined(),
            "page {} freed while still write-combined",
            page.dma()
        );
        let count = 1u64 << page.order();
        self.state.with_lock(|s| {
            s.stats.outstanding -= count;
            s.stats.frees += 1;
        });
    }

    fn set_pages_wc(&self, pages: &mut [DmaPage]) -> bool {
        let ok = self.state.with_lock(|s| {
            if s.fail_wc {
                return false;
            }
            s.stats.wc_batches += 1;
            s.stats.wc_pages += pages.len() as u64;
            true
        });
        if ok {
            for page in pages {
                page.set_write_combined(true);
            }
        }
        ok
    }

    fn set_pages_wb(&self, pages: &mut [DmaPage]) {
        let mut converted = 0u64;
        for page in pages.iter_mut().filter(|p| p.is_write_combined()) {
            page.set_write_combined(false);
            converted += 1;
        }
        self.state.with_lock(|s| {
            s.stats.wc_pages -= converted;
            s.stats.wb_conversions += converted;
        });
    }
}
