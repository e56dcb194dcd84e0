//! Range walks over the table tree.
//!
//! Every structural operation splits an address range by the index bits of
//! each level and recurses into the affected children:
//!
//! ```text
//!  4-level (48 bit)   [47:39] PML4E  [38:30] PDPE  [29:21] PDE  [20:12] PTE
//!  3-level (32 bit)                  [31:30] PDPE  [29:21] PDE  [20:12] PTE
//!  2-level (31 bit)                                [30:22] PDE  [21:12] PTE
//! ```
//!
//! Allocation unwinds on failure so that nothing it created survives; clears
//! free every node they empty, except roots.

mod flat;
mod gen6;
mod gen8;
mod huge;
mod verify;

use crate::entry::{Encoder, Gen8Entry};
use crate::error::GttError;
use crate::node::{Directory, PageTable};
use crate::pool::PageAllocator;
use crate::scratch::ScratchChain;
use crate::sg::SgTable;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::fmt;
use gtt_info::PageSizes;

pub(crate) use flat::FlatTable;
pub use verify::{Inconsistency, Level};

pub(crate) type PageDirectory = Directory<PageTable>;
pub(crate) type Pdp = Directory<PageDirectory>;
pub(crate) type Pml4 = Directory<Pdp>;

pub(crate) const PTE_SHIFT: u32 = 12;
pub(crate) const GEN8_PDE_SHIFT: u32 = 21;
pub(crate) const GEN8_PDPE_SHIFT: u32 = 30;
pub(crate) const GEN8_PML4E_SHIFT: u32 = 39;
pub(crate) const GEN6_PDE_SHIFT: u32 = 22;

/// Page-table organization of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableFormat {
    /// One linear array of PTEs (the global GTT).
    Flat,
    /// Gen6/7: one page directory of 1024-entry page tables.
    TwoLevel,
    /// Gen8 legacy 32-bit: a small root PDP of page directories.
    ThreeLevel,
    /// Gen8 48-bit: PML4 → PDP → PD → PT.
    FourLevel,
}

impl TableFormat {
    /// Largest address space the format can describe.
    #[must_use]
    pub const fn max_total(self) -> u64 {
        match self {
            Self::Flat => 1 << 32,
            Self::TwoLevel => 1 << 31,
            Self::ThreeLevel => 1 << 39,
            Self::FourLevel => 1 << 48,
        }
    }

    /// Granularity the total size must be a multiple of.
    #[must_use]
    pub const fn total_granule(self) -> u64 {
        match self {
            Self::Flat => 1 << PTE_SHIFT,
            Self::TwoLevel => 1 << GEN6_PDE_SHIFT,
            Self::ThreeLevel => 1 << GEN8_PDPE_SHIFT,
            Self::FourLevel => 1 << GEN8_PML4E_SHIFT,
        }
    }

    #[must_use]
    pub const fn is_tree(self) -> bool {
        !matches!(self, Self::Flat)
    }
}

/// One level-aligned piece of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub index: usize,
    pub start: u64,
    pub length: u64,
}

/// Splits `[start, end)` at every `1 << shift` boundary.
pub(crate) struct SlotIter {
    start: u64,
    end: u64,
    shift: u32,
    mask: u64,
}

impl SlotIter {
    pub const fn new(start: u64, length: u64, shift: u32, slots: usize) -> Self {
        Self {
            start,
            end: start + length,
            shift,
            mask: slots as u64 - 1,
        }
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        if self.start >= self.end {
            return None;
        }
        let boundary = (self.start | ((1 << self.shift) - 1)).saturating_add(1);
        let stop = boundary.min(self.end);
        #[allow(clippy::cast_possible_truncation)]
        let index = ((self.start >> self.shift) & self.mask) as usize;
        let slot = Slot {
            index,
            start: self.start,
            length: stop - self.start,
        };
        self.start = stop;
        Some(slot)
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn index_of(addr: u64, shift: u32, slots: usize) -> usize {
    ((addr >> shift) & (slots as u64 - 1)) as usize
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn pte_count(length: u64) -> usize {
    (length >> PTE_SHIFT) as usize
}

/// Context shared by the walkers of one operation.
pub(crate) struct Walk<'a> {
    pub pages: &'a Arc<PageAllocator>,
    pub scratch: &'a ScratchChain,
    dirty: Cell<bool>,
}

impl<'a> Walk<'a> {
    pub const fn new(pages: &'a Arc<PageAllocator>, scratch: &'a ScratchChain) -> Self {
        Self {
            pages,
            scratch,
            dirty: Cell::new(false),
        }
    }

    /// Records that a directory entry above the leaves changed.
    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

/// A request to write PTEs for `pages` starting at `start`.
pub(crate) struct Insert<'a> {
    pub start: u64,
    pub pages: &'a SgTable,
    pub encoder: Encoder,
    /// Leaf sizes the backing store could use; anything beyond 4 KiB routes
    /// through the huge path.
    pub page_sizes: PageSizes,
    /// End of the reserved node, which may extend past the pages.
    pub node_end: u64,
}

/// Table nodes per level, roots included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCount {
    pub pml4: usize,
    pub pdp: usize,
    pub pd: usize,
    pub pt: usize,
}

impl NodeCount {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pml4 + self.pdp + self.pd + self.pt
    }
}

/// The table tree of one address space.
pub(crate) enum Layout {
    Flat(FlatTable),
    TwoLevel(Box<PageDirectory>),
    ThreeLevel(Box<Pdp>),
    FourLevel(Box<Pml4>),
}

impl Layout {
    /// An empty tree: a root whose every slot points at scratch.
    pub fn tree(w: &Walk<'_>, format: TableFormat, total: u64) -> Result<Self, GttError> {
        match format {
            TableFormat::Flat => Err(GttError::Unsupported),
            TableFormat::TwoLevel => gen6::new_root(w, total).map(Self::TwoLevel),
            TableFormat::ThreeLevel => gen8::new_pdp(w, slots_for(total, GEN8_PDPE_SHIFT))
                .map(|(pdp, _)| Self::ThreeLevel(pdp)),
            TableFormat::FourLevel => gen8::new_pml4(w).map(Self::FourLevel),
        }
    }

    pub const fn format(&self) -> TableFormat {
        match self {
            Self::Flat(_) => TableFormat::Flat,
            Self::TwoLevel(_) => TableFormat::TwoLevel,
            Self::ThreeLevel(_) => TableFormat::ThreeLevel,
            Self::FourLevel(_) => TableFormat::FourLevel,
        }
    }

    /// Makes `[start, start + length)` backed by page tables.
    pub fn allocate(&mut self, w: &Walk<'_>, start: u64, length: u64) -> Result<(), GttError> {
        match self {
            Self::Flat(_) => Ok(()),
            Self::TwoLevel(pd) => gen6::alloc(w, pd, start, length),
            Self::ThreeLevel(pdp) => gen8::alloc_pdp(w, pdp, start, length),
            Self::FourLevel(pml4) => gen8::alloc_pml4(w, pml4, start, length),
        }
    }

    /// Points the range at scratch and frees emptied nodes.
    pub fn clear(&mut self, w: &Walk<'_>, start: u64, length: u64) {
        match self {
            Self::Flat(table) => table.clear(w.scratch.pte, start, length),
            Self::TwoLevel(pd) => {
                gen6::clear(w, pd, start, length);
            }
            Self::ThreeLevel(pdp) => {
                gen8::clear_pdp(w, pdp, start, length);
            }
            Self::FourLevel(pml4) => gen8::clear_pml4(w, pml4, start, length),
        }
    }

    pub fn insert(&mut self, w: &Walk<'_>, req: &Insert<'_>) -> Result<(), GttError> {
        match self {
            Self::Flat(table) => table.insert(req),
            Self::TwoLevel(pd) => gen6::insert(pd, req),
            Self::ThreeLevel(pdp) => gen8::insert_3lvl(pdp, req),
            Self::FourLevel(pml4) if req.page_sizes.has_huge() => huge::insert(w, pml4, req),
            Self::FourLevel(pml4) => gen8::insert_4lvl(pml4, req),
        }
    }

    /// Every PTE slot in the range is reserved.
    pub fn is_allocated(&self, start: u64, length: u64) -> bool {
        match self {
            Self::Flat(table) => start + length <= table.total(),
            Self::TwoLevel(pd) => gen6::is_allocated(pd, start, length),
            Self::ThreeLevel(pdp) => gen8::pdp_is_allocated(pdp, start, length),
            Self::FourLevel(pml4) => gen8::pml4_is_allocated(pml4, start, length),
        }
    }

    /// Resets every table to scratch while keeping the tree shape, for
    /// replaying bindings after the device lost its memory.
    pub fn reset(&mut self, w: &Walk<'_>) {
        match self {
            Self::Flat(table) => table.clear(w.scratch.pte, 0, table.total()),
            Self::TwoLevel(pd) => gen6::reset(w, pd),
            Self::ThreeLevel(pdp) => gen8::reset_pdp(w, pdp),
            Self::FourLevel(pml4) => gen8::reset_pml4(w, pml4),
        }
    }

    /// Raw leaf entry mapping `addr`, or `None` if no page table covers it.
    pub fn read_pte(&self, addr: u64) -> Option<u64> {
        match self {
            Self::Flat(table) => table.read(addr >> PTE_SHIFT),
            Self::TwoLevel(pd) => gen6::read_pte(pd, addr),
            Self::ThreeLevel(pdp) => gen8::pdp_leaf(pdp, addr).map(|(_, pte)| pte),
            Self::FourLevel(pml4) => gen8::pml4_leaf(pml4, addr).map(|(_, pte)| pte),
        }
    }

    /// Raw directory entry above the page table covering `addr`.
    pub fn read_pde(&self, addr: u64) -> Option<u64> {
        match self {
            Self::Flat(_) => None,
            Self::TwoLevel(pd) => Some(pd.read(index_of(addr, GEN6_PDE_SHIFT, pd.slots()))),
            Self::ThreeLevel(pdp) => gen8::pdp_leaf(pdp, addr).map(|(pde, _)| pde),
            Self::FourLevel(pml4) => gen8::pml4_leaf(pml4, addr).map(|(pde, _)| pde),
        }
    }

    pub fn count(&self) -> NodeCount {
        let mut n = NodeCount::default();
        match self {
            Self::Flat(_) => {}
            Self::TwoLevel(pd) => {
                n.pd = 1;
                n.pt = pd.used();
            }
            Self::ThreeLevel(pdp) => {
                n.pdp = 1;
                gen8::count_pdp(pdp, &mut n);
            }
            Self::FourLevel(pml4) => {
                n.pml4 = 1;
                for (_, pdp) in pml4.children() {
                    n.pdp += 1;
                    gen8::count_pdp(pdp, &mut n);
                }
            }
        }
        n
    }

    pub fn verify(&self, w: &Walk<'_>, format: crate::entry::PteFormat) -> Vec<Inconsistency> {
        verify::verify(self, w, format)
    }

    pub fn dump(&self, w: &Walk<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        verify::dump(self, w, out)
    }
}

const fn slots_for(total: u64, shift: u32) -> usize {
    let n = total >> shift;
    #[allow(clippy::cast_possible_truncation)]
    let n = if n == 0 { 1 } else { n as usize };
    n
}

/// The PDE that points at `pt` without any leaf-size hints.
#[inline]
pub(crate) fn plain_pde(pt: &PageTable) -> u64 {
    Gen8Entry::pde(pt.dma()).into_bits()
}
