//! The scratch chain.
//!
//! Every slot that maps nothing points at a scratch node of the next level
//! down, and the chain bottoms out at a single scratch page. Stray GPU
//! accesses to unmapped addresses therefore land in harmless memory instead
//! of faulting.
//!
//! ```text
//!  scratch PDP ──► scratch PD ──► scratch PT ──► scratch page
//!  (4-level)       (3/4-level)    (2/3/4-level)  (all)
//! ```

use crate::CacheLevel;
use crate::entry::{Gen6Entry, Gen8Entry, PteFormat};
use crate::error::GttError;
use crate::page::TablePage;
use crate::pool::PageAllocator;
use crate::walk::TableFormat;
use alloc::sync::Arc;
use gtt_addresses::DmaAddress;
use log::debug;

/// Scratch page order used when 64 KiB leaves may be in play.
const ORDER_64K: u8 = 4;

pub(crate) struct ScratchChain {
    // Declaration order is release order.
    pdp: Option<TablePage>,
    pd: Option<TablePage>,
    pt: Option<TablePage>,
    page: TablePage,
    /// Encoded entries pointing at each scratch level.
    pub pte: u64,
    pub pde: u64,
    pub pdpe: u64,
    pub pml4e: u64,
    narrow_pt: bool,
}

impl ScratchChain {
    /// Builds the chain bottom-up. On failure everything already allocated
    /// is released again.
    ///
    /// A 64 KiB scratch page is tried when `want_64k`. If that fails the
    /// chain falls back to 4 KiB unless `require_64k`.
    pub fn new(
        pages: &Arc<PageAllocator>,
        format: TableFormat,
        pte_format: PteFormat,
        want_64k: bool,
        require_64k: bool,
    ) -> Result<Self, GttError> {
        let page = Self::scratch_page(pages, want_64k, require_64k)?;
        let pte = pte_format.encode(page.dma(), CacheLevel::Llc, pte_format.supports_read_only());
        let mut chain = Self {
            pdp: None,
            pd: None,
            pt: None,
            page,
            pte,
            pde: 0,
            pdpe: 0,
            pml4e: 0,
            narrow_pt: format == TableFormat::TwoLevel,
        };

        match format {
            TableFormat::Flat => {}
            TableFormat::TwoLevel => {
                let mut pt = pages.acquire()?;
                pt.fill_u32(narrow(pte));
                chain.pde = u64::from(Gen6Entry::pde(pt.dma()).into_bits());
                chain.pt = Some(pt);
            }
            TableFormat::ThreeLevel | TableFormat::FourLevel => {
                let mut pt = pages.acquire()?;
                pt.fill_u64(pte);
                chain.pde = Gen8Entry::pde(pt.dma()).into_bits();
                chain.pt = Some(pt);

                let mut pd = pages.acquire()?;
                pd.fill_u64(chain.pde);
                chain.pdpe = Gen8Entry::pde(pd.dma()).into_bits();
                chain.pd = Some(pd);

                if format == TableFormat::FourLevel {
                    let mut pdp = pages.acquire()?;
                    pdp.fill_u64(chain.pdpe);
                    chain.pml4e = Gen8Entry::pde(pdp.dma()).into_bits();
                    chain.pdp = Some(pdp);
                }
            }
        }
        Ok(chain)
    }

    fn scratch_page(
        pages: &Arc<PageAllocator>,
        want_64k: bool,
        require_64k: bool,
    ) -> Result<TablePage, GttError> {
        if want_64k {
            match pages.acquire_order(ORDER_64K) {
                Ok(page) => return Ok(page),
                Err(e) if require_64k => return Err(e),
                Err(_) => debug!("64K scratch page unavailable, using 4K"),
            }
        }
        pages.acquire_order(0)
    }

    /// The scratch page is 64 KiB.
    pub fn is_64k(&self) -> bool {
        self.page.order() == ORDER_64K
    }

    pub fn page_dma(&self) -> DmaAddress {
        self.page.dma()
    }

    pub fn page_size(&self) -> u64 {
        self.page.size()
    }

    /// Rewrites every scratch node, after the device lost its contents.
    pub fn rewrite(&mut self) {
        self.page.zero();
        if let Some(pt) = &mut self.pt {
            if self.narrow_pt {
                pt.fill_u32(narrow(self.pte));
            } else {
                pt.fill_u64(self.pte);
            }
        }
        if let Some(pd) = &mut self.pd {
            pd.fill_u64(self.pde);
        }
        if let Some(pdp) = &mut self.pdp {
            pdp.fill_u64(self.pdpe);
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn narrow(entry: u64) -> u32 {
    entry as u32
}
