//! Page-table page recycling.
//!
//! ```text
//!   acquire ──► local stash ──► device WC pool ──► backend batch (WC convert)
//!                  ▲                 ▲
//!   release ───────┘ (overflow) ─────┘ (overflow) ──► WB convert ──► backend
//! ```
//!
//! Each address space owns a [`PageAllocator`] with a small local stash. On
//! parts without a shared LLC, table pages must be write-combined and the
//! conversion is expensive, so converted pages are also parked in a
//! device-wide [`WcPool`]. Lock order is local stash, then pool. Neither lock
//! is ever held across a backend call.

use crate::error::GttError;
use crate::page::{DmaPage, PageBackend, TablePage};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use gtt_sync::{SpinLock, might_sleep};
use log::{debug, trace, warn};

/// Device-wide stash of write-combined pages.
pub struct WcPool {
    backend: Arc<dyn PageBackend>,
    capacity: usize,
    stash: SpinLock<Vec<DmaPage>>,
}

impl WcPool {
    #[must_use]
    pub fn new(backend: Arc<dyn PageBackend>, capacity: usize) -> Self {
        Self {
            backend,
            capacity,
            stash: SpinLock::new(Vec::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stash.with_lock(|s| s.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn pop(&self) -> Option<DmaPage> {
        self.stash.with_lock(Vec::pop)
    }

    /// Moves as many pages off the tail of `pages` as fit.
    fn absorb(&self, pages: &mut Vec<DmaPage>) {
        let mut stash = self.stash.lock();
        let room = self.capacity.saturating_sub(stash.len());
        let keep = pages.len().saturating_sub(room);
        stash.extend(pages.drain(keep..));
    }

    /// Returns every cached page to the backend. Returns the number freed.
    pub fn shrink(&self) -> usize {
        let mut pages = Vec::with_capacity(self.capacity);
        self.stash.with_lock(|s| core::mem::swap(s, &mut pages));
        free_batch(self.backend.as_ref(), pages, true)
    }

    /// Driver unload.
    pub fn teardown(&self) {
        let freed = self.shrink();
        debug!("wc pool torn down, {freed} pages released");
    }
}

impl Drop for WcPool {
    fn drop(&mut self) {
        self.shrink();
    }
}

fn free_batch(backend: &dyn PageBackend, mut pages: Vec<DmaPage>, wc: bool) -> usize {
    let n = pages.len();
    if n == 0 {
        return 0;
    }
    if wc {
        backend.set_pages_wb(&mut pages);
    }
    for page in pages {
        backend.free_pages(page);
    }
    n
}

/// Memory that can be given back when page allocation fails.
pub trait Reclaim: Send + Sync {
    /// Frees what it can without blocking on address-space locks. Returns
    /// the number of pages released.
    fn reclaim(&self) -> usize;
}

/// Per-address-space page allocator.
pub struct PageAllocator {
    backend: Arc<dyn PageBackend>,
    pool: Arc<WcPool>,
    wc: bool,
    capacity: usize,
    stash: SpinLock<Vec<DmaPage>>,
    reclaim: Option<Arc<dyn Reclaim>>,
    live: AtomicUsize,
    fail_countdown: AtomicUsize,
}

impl PageAllocator {
    /// `wc` selects write-combined table pages and routes them through
    /// `pool`. The pool is shrunk on reclaim either way.
    #[must_use]
    pub fn new(backend: Arc<dyn PageBackend>, pool: Arc<WcPool>, wc: bool) -> Self {
        let capacity = pool.capacity();
        Self {
            backend,
            pool,
            wc,
            capacity,
            stash: SpinLock::new(Vec::with_capacity(capacity)),
            reclaim: None,
            live: AtomicUsize::new(0),
            fail_countdown: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_reclaim(mut self, reclaim: Arc<dyn Reclaim>) -> Self {
        self.reclaim = Some(reclaim);
        self
    }

    #[must_use]
    pub const fn is_write_combined(&self) -> bool {
        self.wc
    }

    /// Pages currently on loan, scratch pages included.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stashed(&self) -> usize {
        self.stash.with_lock(|s| s.len())
    }

    /// Makes the `n`-th acquisition from now fail as if memory ran out.
    /// `0` disarms.
    pub fn fail_nth(&self, n: usize) {
        self.fail_countdown.store(n, Ordering::Release);
    }

    fn injected_failure(&self) -> bool {
        self.fail_countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok_and(|prev| prev == 1)
    }

    /// A zeroed page for a table node.
    pub fn acquire(self: &Arc<Self>) -> Result<TablePage, GttError> {
        might_sleep();
        if self.injected_failure() {
            debug!("injected page allocation failure");
            return Err(GttError::OutOfMemory);
        }

        let page = match self.try_acquire() {
            Some(page) => page,
            None => {
                let freed = self.reclaim_all();
                debug!("table page allocation failed, reclaimed {freed} pages");
                self.try_acquire().ok_or(GttError::OutOfMemory)?
            }
        };
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(TablePage::new(page, Arc::clone(self)))
    }

    /// A `1 << order` page straight from the backend, bypassing the stashes.
    pub fn acquire_order(self: &Arc<Self>, order: u8) -> Result<TablePage, GttError> {
        might_sleep();
        if self.injected_failure() {
            return Err(GttError::OutOfMemory);
        }
        let page = match self.backend.alloc_pages(order) {
            Some(page) => page,
            None => {
                self.reclaim_all();
                self.backend
                    .alloc_pages(order)
                    .ok_or(GttError::OutOfMemory)?
            }
        };
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(TablePage::new(page, Arc::clone(self)))
    }

    fn try_acquire(&self) -> Option<DmaPage> {
        let cached = self
            .stash
            .with_lock(Vec::pop)
            .or_else(|| if self.wc { self.pool.pop() } else { None });
        if let Some(mut page) = cached {
            page.zero();
            return Some(page);
        }
        if !self.wc {
            return self.backend.alloc_pages(0);
        }
        self.acquire_wc_batch()
    }

    /// Allocates up to a stash worth of pages, converts them to WC in one
    /// call, keeps one and parks the rest.
    fn acquire_wc_batch(&self) -> Option<DmaPage> {
        let mut batch = Vec::with_capacity(self.capacity.max(1));
        while batch.len() < batch.capacity() {
            match self.backend.alloc_pages(0) {
                Some(page) => batch.push(page),
                None => break,
            }
        }
        if batch.is_empty() {
            return None;
        }
        if !self.backend.set_pages_wc(&mut batch) {
            warn!("write-combine conversion of {} pages failed", batch.len());
            free_batch(self.backend.as_ref(), batch, false);
            return None;
        }
        trace!("converted a batch of {} pages to WC", batch.len());

        let page = batch.pop();
        self.pool.absorb(&mut batch);
        self.absorb_local(&mut batch);
        free_batch(self.backend.as_ref(), batch, true);
        page
    }

    fn absorb_local(&self, pages: &mut Vec<DmaPage>) {
        let mut stash = self.stash.lock();
        let room = self.capacity.saturating_sub(stash.len());
        let keep = pages.len().saturating_sub(room);
        stash.extend(pages.drain(keep..));
    }

    /// Takes a page back. Table pages are recycled; anything else returns to
    /// the backend.
    pub(crate) fn release(&self, page: DmaPage) {
        might_sleep();
        self.live.fetch_sub(1, Ordering::AcqRel);

        if page.order() != 0 || page.is_write_combined() != self.wc {
            let wc = page.is_write_combined();
            let mut single = Vec::with_capacity(1);
            single.push(page);
            free_batch(self.backend.as_ref(), single, wc);
            return;
        }

        let mut page = Some(page);
        self.stash.with_lock(|s| {
            if s.len() < self.capacity {
                s.extend(page.take());
            }
        });
        let Some(page) = page else {
            return;
        };

        // Local stash is full: spill it into the shared pool, then retry.
        let mut spill = Vec::with_capacity(self.capacity + 1);
        self.stash.with_lock(|s| core::mem::swap(s, &mut spill));
        spill.push(page);
        if self.wc {
            self.pool.absorb(&mut spill);
        }
        self.absorb_local(&mut spill);
        free_batch(self.backend.as_ref(), spill, self.wc);
    }

    /// Gives back the local stash.
    pub fn shrink(&self) -> usize {
        let mut pages = Vec::with_capacity(self.capacity);
        self.stash.with_lock(|s| core::mem::swap(s, &mut pages));
        free_batch(self.backend.as_ref(), pages, self.wc)
    }

    /// Like [`shrink`](Self::shrink) but skips a contended stash.
    fn try_shrink(&self) -> usize {
        let mut pages = Vec::with_capacity(self.capacity);
        let Some(mut stash) = self.stash.try_lock() else {
            return 0;
        };
        core::mem::swap(&mut *stash, &mut pages);
        drop(stash);
        free_batch(self.backend.as_ref(), pages, self.wc)
    }

    fn reclaim_all(&self) -> usize {
        let mut freed = self.shrink() + self.pool.shrink();
        if let Some(reclaim) = &self.reclaim {
            freed += reclaim.reclaim();
        }
        freed
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        self.shrink();
    }
}

/// Device-wide reclaim: the shared pool, every address space's stash, and
/// any registered hooks.
pub(crate) struct ReclaimRegistry {
    pool: Arc<WcPool>,
    allocators: SpinLock<Vec<Weak<PageAllocator>>>,
    hooks: SpinLock<Vec<Arc<dyn Reclaim>>>,
}

impl ReclaimRegistry {
    pub fn new(pool: Arc<WcPool>) -> Self {
        Self {
            pool,
            allocators: SpinLock::new(Vec::new()),
            hooks: SpinLock::new(Vec::new()),
        }
    }

    pub fn register(&self, allocator: &Arc<PageAllocator>) {
        let weak = Arc::downgrade(allocator);
        self.allocators.with_lock(|list| {
            list.retain(|w| w.strong_count() > 0);
            list.push(weak);
        });
    }

    pub fn add_hook(&self, hook: Arc<dyn Reclaim>) {
        self.hooks.with_lock(|h| h.push(hook));
    }
}

impl Reclaim for ReclaimRegistry {
    fn reclaim(&self) -> usize {
        let allocators: Vec<Arc<PageAllocator>> = self
            .allocators
            .with_lock(|list| list.iter().filter_map(Weak::upgrade).collect());
        let hooks: Vec<Arc<dyn Reclaim>> = self.hooks.with_lock(|h| h.clone());

        let mut freed = self.pool.shrink();
        for allocator in allocators {
            freed += allocator.try_shrink();
        }
        for hook in hooks {
            freed += hook.reclaim();
        }
        freed
    }
}
