//! GPU virtual address spaces.
//!
//! An [`AddressSpace`] owns a table tree (or, for the GGTT, a flat PTE
//! window), a range allocator deciding where objects go, and the records of
//! what is bound where. Structural changes are serialized by a space-wide
//! ticket lock; page recycling underneath uses short spin locks only.
//!
//! ```text
//!  bind ──► reserve node ──► allocate tables ──► write PTEs ──► record
//!              │  (lock)          (lock, unwinds on error)        (lock)
//!              └─ collision ──► evict overlapping ──► retry once
//! ```

use crate::device::Device;
use crate::entry::{Encoder, PteFormat};
use crate::error::GttError;
use crate::gsm::GsmWindow;
use crate::page::PAGE_SIZE;
use crate::pool::PageAllocator;
use crate::range::RangeAllocator;
use crate::scratch::ScratchChain;
use crate::sg::SgTable;
use crate::walk::{FlatTable, Inconsistency, Insert, Layout, NodeCount, TableFormat, Walk};
use crate::{BindFlags, CacheLevel};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use gtt_addresses::{GttAddress, GttRange, checked_align_up, is_aligned};
use gtt_info::{Errata, PageSizes};
use gtt_sync::TicketMutex;
use log::{debug, trace, warn};

const SIZE_2M: u64 = 2 << 20;

/// Where a binding should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Lowest free hole with at least this alignment.
    Anywhere { alignment: u64 },
    /// Exactly at `offset`. With `evict`, overlapping bindings are evicted
    /// first instead of failing.
    Fixed { offset: GttAddress, evict: bool },
}

/// Parameters of [`AddressSpace::bind`].
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub pages: Arc<SgTable>,
    pub placement: Placement,
    pub cache: CacheLevel,
    pub flags: BindFlags,
}

impl BindRequest {
    #[must_use]
    pub fn new(pages: Arc<SgTable>) -> Self {
        Self {
            pages,
            placement: Placement::Anywhere {
                alignment: PAGE_SIZE,
            },
            cache: CacheLevel::Llc,
            flags: BindFlags::empty(),
        }
    }

    #[must_use]
    pub const fn at(mut self, offset: GttAddress) -> Self {
        self.placement = Placement::Fixed {
            offset,
            evict: false,
        };
        self
    }

    #[must_use]
    pub const fn at_evicting(mut self, offset: GttAddress) -> Self {
        self.placement = Placement::Fixed {
            offset,
            evict: true,
        };
        self
    }

    #[must_use]
    pub const fn aligned(mut self, alignment: u64) -> Self {
        self.placement = Placement::Anywhere { alignment };
        self
    }

    #[must_use]
    pub const fn cache(mut self, cache: CacheLevel) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub const fn flags(mut self, flags: BindFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A live binding.
#[derive(Debug, Clone)]
pub struct Binding {
    /// The reserved node; may extend past the pages for huge-page padding.
    pub node: GttRange,
    pub pages: Arc<SgTable>,
    pub cache: CacheLevel,
    pub flags: BindFlags,
}

impl Binding {
    /// The part of the node actually backed by pages.
    #[must_use]
    pub fn mapped(&self) -> GttRange {
        GttRange::new(self.node.start(), self.pages.len())
    }
}

/// Frees address ranges for a fixed placement.
pub trait Evictor: Send + Sync {
    /// Makes `range` free, usually by unbinding whatever overlaps it. Runs
    /// without the space lock held.
    fn evict_for_range(&self, space: &AddressSpace, range: GttRange) -> Result<(), GttError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStats {
    pub nodes: NodeCount,
    pub bindings: usize,
    /// Table and scratch pages on loan to this space.
    pub live_pages: usize,
    /// Freed table pages cached for reuse.
    pub stashed_pages: usize,
}

struct SpaceState {
    // Tree before scratch: nodes are released before the chain they point at.
    layout: Layout,
    scratch: ScratchChain,
    ranges: RangeAllocator,
    bindings: BTreeMap<u64, Binding>,
}

pub struct AddressSpace {
    name: &'static str,
    device: Arc<Device>,
    format: TableFormat,
    pte_format: PteFormat,
    total: u64,
    huge: PageSizes,
    pages: Arc<PageAllocator>,
    state: TicketMutex<SpaceState>,
    evictor: Option<Arc<dyn Evictor>>,
    needs_invalidate: AtomicBool,
    tlb_dirty: AtomicBool,
}

impl AddressSpace {
    /// `gsm` backs a [`TableFormat::Flat`] space; trees ignore it and span
    /// `total` bytes.
    pub(crate) fn new(
        device: &Arc<Device>,
        name: &'static str,
        format: TableFormat,
        total: u64,
        gsm: Option<Box<dyn GsmWindow>>,
    ) -> Result<Self, GttError> {
        let info = device.info();
        let generation = info.generation;
        let supported = match format {
            TableFormat::Flat => gsm.is_some(),
            TableFormat::TwoLevel => (6..8).contains(&generation),
            TableFormat::ThreeLevel | TableFormat::FourLevel => generation >= 8,
        };
        if !supported {
            return Err(GttError::Unsupported);
        }
        if format.is_tree()
            && (!total.is_power_of_two()
                || total < format.total_granule()
                || total > format.max_total())
        {
            return Err(GttError::invalid(0, total));
        }

        let pte_format = if format.is_tree() {
            PteFormat::ppgtt(generation)
        } else {
            PteFormat::ggtt(generation)
        };
        let huge = if format == TableFormat::FourLevel {
            info.huge_page_sizes(device.config())
        } else {
            PageSizes::SIZE_4K
        };

        let pages = device.page_allocator();
        let want_64k = huge.contains(PageSizes::SIZE_64K);
        let require_64k = want_64k && info.errata.contains(Errata::SCRATCH_64K);
        let scratch = ScratchChain::new(&pages, format, pte_format, want_64k, require_64k)?;

        let layout = match gsm {
            Some(gsm) if !format.is_tree() => Layout::Flat(FlatTable::new(gsm)),
            _ => Layout::tree(&Walk::new(&pages, &scratch), format, total)?,
        };
        let total = match &layout {
            Layout::Flat(table) => table.total(),
            _ => total,
        };

        debug!(
            "{name}: {format:?} address space of {total:#x} bytes, scratch {} bytes",
            scratch.page_size()
        );
        Ok(Self {
            name,
            device: Arc::clone(device),
            format,
            pte_format,
            total,
            huge,
            pages,
            state: TicketMutex::new(SpaceState {
                layout,
                scratch,
                ranges: RangeAllocator::new(0, total),
                bindings: BTreeMap::new(),
            }),
            evictor: None,
            needs_invalidate: AtomicBool::new(false),
            tlb_dirty: AtomicBool::new(false),
        })
    }

    /// Replaces the default eviction (unbind everything overlapping).
    #[must_use]
    pub fn with_evictor(mut self, evictor: Arc<dyn Evictor>) -> Self {
        self.evictor = Some(evictor);
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn format(&self) -> TableFormat {
        self.format
    }

    #[must_use]
    pub const fn pte_format(&self) -> PteFormat {
        self.pte_format
    }

    /// Size of the address space in bytes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub const fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.pages
    }

    /// The PTE every unmapped slot holds.
    #[must_use]
    pub fn scratch_pte(&self) -> u64 {
        self.state.lock().scratch.pte
    }

    #[must_use]
    pub fn scratch_page_size(&self) -> u64 {
        self.state.lock().scratch.page_size()
    }

    fn validate(&self, start: u64, length: u64) -> Result<(), GttError> {
        let ok = length != 0
            && is_aligned(start, PAGE_SIZE)
            && is_aligned(length, PAGE_SIZE)
            && start.checked_add(length).is_some_and(|end| end <= self.total);
        if ok {
            Ok(())
        } else {
            Err(GttError::invalid(start, length))
        }
    }

    fn encoder(&self, cache: CacheLevel, flags: BindFlags) -> Result<Encoder, GttError> {
        let read_only = flags.contains(BindFlags::READ_ONLY);
        if read_only && !self.pte_format.supports_read_only() {
            return Err(GttError::Unsupported);
        }
        Ok(Encoder {
            format: self.pte_format,
            cache,
            read_only,
        })
    }

    fn leaf_sizes(&self, pages: &SgTable) -> PageSizes {
        if self.format == TableFormat::FourLevel {
            pages.gtt_page_sizes(self.huge)
        } else {
            PageSizes::SIZE_4K
        }
    }

    /// Runs `f` on the tree under the space lock.
    fn with_walk<R>(&self, f: impl FnOnce(&mut Layout, &Walk<'_>) -> R) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let w = Walk::new(&self.pages, &state.scratch);
        let result = f(&mut state.layout, &w);
        if w.is_dirty() {
            self.tlb_dirty.store(true, Ordering::Release);
        }
        result
    }

    fn request_invalidate(&self) {
        self.needs_invalidate.store(true, Ordering::Release);
    }

    /// Makes `[start, start + length)` backed by page tables. Unwinds fully
    /// on failure.
    pub fn allocate_va_range(&self, start: GttAddress, length: u64) -> Result<(), GttError> {
        self.device.ensure_awake()?;
        let start = start.as_u64();
        self.validate(start, length)?;
        self.with_walk(|layout, w| layout.allocate(w, start, length))
    }

    /// Points every PTE in the range at scratch and frees tables that end up
    /// unused. Clearing an already clear range is a no-op.
    pub fn clear_range(&self, start: GttAddress, length: u64) -> Result<(), GttError> {
        self.device.ensure_awake()?;
        let start = start.as_u64();
        self.validate(start, length)?;
        self.with_walk(|layout, w| layout.clear(w, start, length));
        self.request_invalidate();
        Ok(())
    }

    /// Writes PTEs for `pages` into an already allocated range.
    pub fn insert_entries(
        &self,
        start: GttAddress,
        pages: &SgTable,
        cache: CacheLevel,
        flags: BindFlags,
    ) -> Result<(), GttError> {
        self.device.ensure_awake()?;
        let start = start.as_u64();
        self.validate(start, pages.len())?;
        let req = Insert {
            start,
            pages,
            encoder: self.encoder(cache, flags)?,
            page_sizes: self.leaf_sizes(pages),
            node_end: start + pages.len(),
        };
        self.with_walk(|layout, w| {
            if !layout.is_allocated(start, pages.len()) {
                return Err(GttError::invalid(start, pages.len()));
            }
            layout.insert(w, &req)
        })?;
        self.request_invalidate();
        Ok(())
    }

    /// Reserves a node, maps `req.pages` into it and records the binding.
    pub fn bind(&self, req: &BindRequest) -> Result<GttRange, GttError> {
        self.bind_with(req, |node| self.map(node, req))
    }

    /// [`bind`](Self::bind) with a custom mapping step. `write` runs without
    /// the space lock; if it fails the node is released again.
    pub(crate) fn bind_with(
        &self,
        req: &BindRequest,
        write: impl FnOnce(GttRange) -> Result<(), GttError>,
    ) -> Result<GttRange, GttError> {
        self.check_request(req)?;
        let node = self.reserve_node(req)?;

        if let Err(e) = write(node) {
            debug!("{}: binding at {node} failed: {e}", self.name);
            self.release_node(node);
            return Err(e);
        }

        self.state.with_lock(|s| {
            s.bindings.insert(
                node.start().as_u64(),
                Binding {
                    node,
                    pages: Arc::clone(&req.pages),
                    cache: req.cache,
                    flags: req.flags,
                },
            )
        });
        self.request_invalidate();
        trace!("{}: bound {} bytes at {node}", self.name, req.pages.len());
        Ok(node)
    }

    /// Everything about `req` that can be rejected without touching the
    /// space. Runs before any eviction.
    pub(crate) fn check_request(&self, req: &BindRequest) -> Result<(), GttError> {
        self.device.ensure_awake()?;
        self.encoder(req.cache, req.flags)?;
        let size = req.pages.len();
        match req.placement {
            Placement::Anywhere { alignment } => {
                if alignment != 0 && (!alignment.is_power_of_two() || alignment > self.total) {
                    return Err(GttError::invalid(0, size));
                }
                Ok(())
            }
            Placement::Fixed { offset, .. } => self.validate(offset.as_u64(), size),
        }
    }

    /// Allocates tables for `node` and writes the PTEs of `req`.
    pub(crate) fn map(&self, node: GttRange, req: &BindRequest) -> Result<(), GttError> {
        let start = node.start().as_u64();
        let length = req.pages.len();
        let insert = Insert {
            start,
            pages: &req.pages,
            encoder: self.encoder(req.cache, req.flags)?,
            page_sizes: self.leaf_sizes(&req.pages),
            node_end: node.end().as_u64(),
        };
        self.with_walk(|layout, w| {
            layout.allocate(w, start, length)?;
            layout
                .insert(w, &insert)
                .inspect_err(|_| layout.clear(w, start, length))
        })
    }

    fn reserve_node(&self, req: &BindRequest) -> Result<GttRange, GttError> {
        let size = req.pages.len();
        match req.placement {
            Placement::Anywhere { alignment } => {
                let mut alignment = alignment.max(PAGE_SIZE);
                let mut size = size;
                let sizes = self.leaf_sizes(&req.pages);
                if sizes.contains(PageSizes::SIZE_64K) {
                    // 64K and 4K leaves cannot share a page table.
                    alignment = alignment.max(SIZE_2M);
                    size = checked_align_up(size, SIZE_2M).ok_or(GttError::NoSpace)?;
                } else if sizes.has_huge() {
                    alignment = alignment.max(sizes.largest());
                }
                if size > self.total {
                    return Err(GttError::NoSpace);
                }
                self.state.with_lock(|s| s.ranges.insert(size, alignment))
            }
            Placement::Fixed { offset, evict } => {
                let node = GttRange::new(offset, size);
                match self.state.with_lock(|s| s.ranges.reserve(node)) {
                    Err(GttError::EvictionRequired { .. }) if evict => {
                        self.evict_for(node)?;
                        self.state
                            .with_lock(|s| s.ranges.reserve(node))
                            .map_err(|e| match e {
                                GttError::EvictionRequired { .. } => GttError::NoSpace,
                                other => other,
                            })?;
                        Ok(node)
                    }
                    other => other.map(|()| node),
                }
            }
        }
    }

    fn evict_for(&self, node: GttRange) -> Result<(), GttError> {
        debug!("{}: evicting for {node}", self.name);
        match &self.evictor {
            Some(evictor) => evictor.evict_for_range(self, node),
            None => {
                self.evict_range(node);
                Ok(())
            }
        }
    }

    /// Unbinds every binding overlapping `range`. Returns how many went.
    pub fn evict_range(&self, range: GttRange) -> usize {
        let victims: Vec<GttAddress> = self.state.with_lock(|s| {
            s.ranges
                .overlapping(range)
                .into_iter()
                .map(|r| r.start())
                .filter(|start| s.bindings.contains_key(&start.as_u64()))
                .collect()
        });
        victims.into_iter().filter(|&start| self.unbind(start)).count()
    }

    /// Removes the binding starting at `start`. Returns `false` if there was
    /// none, so unbinding twice is harmless.
    pub fn unbind(&self, start: GttAddress) -> bool {
        let Some(binding) = self.take_binding(start) else {
            return false;
        };
        self.unmap(&binding);
        self.release_node(binding.node);
        true
    }

    pub(crate) fn take_binding(&self, start: GttAddress) -> Option<Binding> {
        self.state.with_lock(|s| s.bindings.remove(&start.as_u64()))
    }

    pub(crate) fn unmap(&self, binding: &Binding) {
        let mapped = binding.mapped();
        self.with_walk(|layout, w| layout.clear(w, mapped.start().as_u64(), mapped.len()));
        self.request_invalidate();
        trace!("{}: unbound {mapped}", self.name);
    }

    pub(crate) fn release_node(&self, node: GttRange) {
        self.state.with_lock(|s| s.ranges.remove(node.start().as_u64()));
    }

    /// Rewrites scratch and every table, then replays all bindings. Used
    /// after the device lost its memory, e.g. across suspend.
    pub fn restore_mappings(&self) -> Result<(), GttError> {
        self.device.ensure_awake()?;
        self.restore_with(None)
    }

    /// Like [`restore_mappings`](Self::restore_mappings), replaying
    /// `bindings` instead of the space's own records when given.
    pub(crate) fn restore_with(&self, bindings: Option<&[Binding]>) -> Result<(), GttError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.scratch.rewrite();
        let w = Walk::new(&self.pages, &state.scratch);
        state.layout.reset(&w);
        let mut replayed = 0usize;
        let own = state.bindings.values();
        let replay: Box<dyn Iterator<Item = &Binding>> = match bindings {
            Some(list) => Box::new(list.iter()),
            None => Box::new(own),
        };
        for binding in replay {
            let insert = Insert {
                start: binding.node.start().as_u64(),
                pages: &binding.pages,
                encoder: self.encoder(binding.cache, binding.flags)?,
                page_sizes: self.leaf_sizes(&binding.pages),
                node_end: binding.node.end().as_u64(),
            };
            state.layout.insert(&w, &insert)?;
            replayed += 1;
        }
        debug!("{}: restored {replayed} bindings", self.name);
        drop(guard);
        self.tlb_dirty.store(true, Ordering::Release);
        self.request_invalidate();
        Ok(())
    }

    /// Points `[start, start + length)` at scratch without validation.
    pub(crate) fn scrub_range(&self, start: GttAddress, length: u64) {
        self.with_walk(|layout, w| layout.clear(w, start.as_u64(), length));
        self.request_invalidate();
    }

    /// Points the whole space at scratch without touching bookkeeping.
    pub(crate) fn scrub(&self) {
        let total = self.total;
        self.with_walk(|layout, w| layout.clear(w, 0, total));
    }

    /// Checks the tree against its bookkeeping. Empty means consistent.
    #[must_use]
    pub fn verify(&self) -> Vec<Inconsistency> {
        let guard = self.state.lock();
        let w = Walk::new(&self.pages, &guard.scratch);
        let mut found = guard.layout.verify(&w, self.pte_format);
        for binding in guard.bindings.values() {
            let mapped = binding.mapped();
            if !guard.layout.is_allocated(mapped.start().as_u64(), mapped.len()) {
                found.push(Inconsistency::Unbacked { range: mapped });
            }
        }
        found
    }

    /// Writes a readable description of the tree to `out`.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let guard = self.state.lock();
        writeln!(
            out,
            "{}: {:?}, {:#x} bytes, {} bindings",
            self.name,
            self.format,
            self.total,
            guard.bindings.len()
        )?;
        let w = Walk::new(&self.pages, &guard.scratch);
        guard.layout.dump(&w, out)
    }

    /// Raw leaf entry for `addr`, or `None` if no page table covers it.
    #[must_use]
    pub fn read_pte(&self, addr: GttAddress) -> Option<u64> {
        self.state.lock().layout.read_pte(addr.as_u64())
    }

    /// Raw directory entry above the page table covering `addr`.
    #[must_use]
    pub fn read_pde(&self, addr: GttAddress) -> Option<u64> {
        self.state.lock().layout.read_pde(addr.as_u64())
    }

    #[must_use]
    pub fn binding(&self, start: GttAddress) -> Option<Binding> {
        self.state.lock().bindings.get(&start.as_u64()).cloned()
    }

    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.values().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        let guard = self.state.lock();
        SpaceStats {
            nodes: guard.layout.count(),
            bindings: guard.bindings.len(),
            live_pages: self.pages.live_pages(),
            stashed_pages: self.pages.stashed(),
        }
    }

    /// PTEs changed since the last call; the GPU-side TLBs need flushing.
    pub fn take_invalidate(&self) -> bool {
        self.needs_invalidate.swap(false, Ordering::AcqRel)
    }

    /// Upper-level entries changed since the last call; contexts caching the
    /// top-level pointers must reload them.
    pub fn take_tlb_dirty(&self) -> bool {
        self.tlb_dirty.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.bindings.is_empty() {
            warn!(
                "{}: torn down with {} bindings still live",
                self.name,
                state.bindings.len()
            );
        }
        debug!("{}: releasing {:?}", self.name, state.layout.count());
    }
}
