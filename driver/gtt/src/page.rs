//! Device-visible page frames and the host allocator behind them.

use crate::pool::PageAllocator;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::ops::{Deref, DerefMut};
use gtt_addresses::DmaAddress;

/// Bytes in the base page.
pub const PAGE_SIZE: u64 = 4096;

const WORDS_PER_PAGE: usize = 512;

/// `1 << order` contiguous pages, DMA-mapped for the GPU and readable by the
/// CPU through `words`.
pub struct DmaPage {
    dma: DmaAddress,
    order: u8,
    write_combined: bool,
    words: Box<[u64]>,
}

impl DmaPage {
    /// A zero-filled page at `dma`.
    #[must_use]
    pub fn new(dma: DmaAddress, order: u8) -> Self {
        Self {
            dma,
            order,
            write_combined: false,
            words: vec![0u64; WORDS_PER_PAGE << order].into_boxed_slice(),
        }
    }

    /// Placeholder left behind after the real page has been moved out.
    fn detached() -> Self {
        Self {
            dma: DmaAddress::new(0),
            order: 0,
            write_combined: false,
            words: Box::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn dma(&self) -> DmaAddress {
        self.dma
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    #[inline]
    #[must_use]
    pub const fn is_write_combined(&self) -> bool {
        self.write_combined
    }

    /// Records the caching attribute. Only page backends should call this.
    #[inline]
    pub const fn set_write_combined(&mut self, wc: bool) {
        self.write_combined = wc;
    }

    #[inline]
    #[must_use]
    pub fn read_u64(&self, index: usize) -> u64 {
        self.words[index]
    }

    #[inline]
    pub fn write_u64(&mut self, index: usize, value: u64) {
        self.words[index] = value;
    }

    #[inline]
    #[must_use]
    pub fn read_u32(&self, index: usize) -> u32 {
        let shift = (index % 2) * 32;
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.words[index / 2] >> shift) as u32;
        v
    }

    #[inline]
    pub fn write_u32(&mut self, index: usize, value: u32) {
        let shift = (index % 2) * 32;
        let word = &mut self.words[index / 2];
        *word = (*word & !(0xffff_ffff << shift)) | (u64::from(value) << shift);
    }

    pub fn fill_u64(&mut self, value: u64) {
        self.words.fill(value);
    }

    pub fn fill_u32(&mut self, value: u32) {
        self.words.fill(u64::from(value) | (u64::from(value) << 32));
    }

    pub fn zero(&mut self) {
        self.words.fill(0);
    }

    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

impl fmt::Debug for DmaPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaPage")
            .field("dma", &self.dma)
            .field("order", &self.order)
            .field("wc", &self.write_combined)
            .finish_non_exhaustive()
    }
}

/// Source of DMA-able pages.
///
/// Implementations may block. The GTT core never calls them with a spin lock
/// held.
pub trait PageBackend: Send + Sync {
    /// `1 << order` zeroed, physically contiguous, write-back pages.
    fn alloc_pages(&self, order: u8) -> Option<DmaPage>;

    /// Returns pages obtained from [`alloc_pages`](Self::alloc_pages). They
    /// must be write-back again.
    fn free_pages(&self, page: DmaPage);

    /// Switches a batch to write-combined in one go. On failure nothing is
    /// converted and `false` is returned.
    fn set_pages_wc(&self, pages: &mut [DmaPage]) -> bool;

    /// Switches a batch back to write-back.
    fn set_pages_wb(&self, pages: &mut [DmaPage]);
}

/// A page-table page on loan from a [`PageAllocator`].
///
/// Dropping it hands the page back, so freeing a node (and its subtree) is
/// a plain drop.
pub struct TablePage {
    page: DmaPage,
    owner: Arc<PageAllocator>,
}

impl TablePage {
    pub(crate) const fn new(page: DmaPage, owner: Arc<PageAllocator>) -> Self {
        Self { page, owner }
    }
}

impl Deref for TablePage {
    type Target = DmaPage;

    fn deref(&self) -> &DmaPage {
        &self.page
    }
}

impl DerefMut for TablePage {
    fn deref_mut(&mut self) -> &mut DmaPage {
        &mut self.page
    }
}

impl Drop for TablePage {
    fn drop(&mut self) {
        let page = core::mem::replace(&mut self.page, DmaPage::detached());
        self.owner.release(page);
    }
}

impl fmt::Debug for TablePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.page, f)
    }
}
