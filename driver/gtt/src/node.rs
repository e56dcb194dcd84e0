//! Table nodes.
//!
//! A [`PageTable`] is a leaf node holding PTEs. A [`Directory`] holds entries
//! pointing at children one level down; a `None` child means the slot holds
//! the scratch entry for that level. Nodes own their backing [`TablePage`],
//! so dropping a node returns its whole subtree to the allocator.

use crate::error::GttError;
use crate::page::TablePage;
use crate::pool::PageAllocator;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use gtt_addresses::DmaAddress;

/// Entry width of a table page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    U32,
    U64,
}

impl Width {
    #[inline]
    fn read(self, page: &TablePage, index: usize) -> u64 {
        match self {
            Self::U32 => u64::from(page.read_u32(index)),
            Self::U64 => page.read_u64(index),
        }
    }

    #[inline]
    fn write(self, page: &mut TablePage, index: usize, value: u64) {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Self::U32 => page.write_u32(index, value as u32),
            Self::U64 => page.write_u64(index, value),
        }
    }

    fn fill(self, page: &mut TablePage, value: u64) {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Self::U32 => page.fill_u32(value as u32),
            Self::U64 => page.fill_u64(value),
        }
    }
}

/// A fixed-size bitset of reserved PTE slots.
#[derive(Debug)]
pub(crate) struct SlotMask {
    words: Box<[u64]>,
}

impl SlotMask {
    fn new(slots: usize) -> Self {
        Self {
            words: alloc::vec![0; slots.div_ceil(64)].into_boxed_slice(),
        }
    }

    /// Sets or clears `[first, first + count)`. Returns how many bits flipped.
    fn update(&mut self, first: usize, count: usize, set: bool) -> usize {
        let mut changed = 0;
        let mut i = first;
        let end = first + count;
        while i < end {
            let bit = i % 64;
            let n = (64 - bit).min(end - i);
            let mask = if n == 64 { u64::MAX } else { ((1u64 << n) - 1) << bit };
            let word = &mut self.words[i / 64];
            let before = *word;
            *word = if set { before | mask } else { before & !mask };
            changed += (before ^ *word).count_ones() as usize;
            i += n;
        }
        changed
    }

    fn all_set(&self, first: usize, count: usize) -> bool {
        (first..first + count).all(|i| self.is_set(i))
    }

    #[inline]
    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Leaf table.
pub(crate) struct PageTable {
    page: TablePage,
    width: Width,
    slots: usize,
    reserved: SlotMask,
}

impl PageTable {
    pub fn alloc(
        pages: &Arc<PageAllocator>,
        width: Width,
        slots: usize,
        scratch_pte: u64,
    ) -> Result<Box<Self>, GttError> {
        let mut page = pages.acquire()?;
        width.fill(&mut page, scratch_pte);
        Ok(Box::new(Self {
            page,
            width,
            slots,
            reserved: SlotMask::new(slots),
        }))
    }

    #[inline]
    pub fn dma(&self) -> DmaAddress {
        self.page.dma()
    }

    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// Reserved PTE slots.
    pub fn used(&self) -> usize {
        self.reserved.count()
    }

    pub fn reserve(&mut self, first: usize, count: usize) {
        self.reserved.update(first, count, true);
    }

    pub fn is_reserved(&self, index: usize) -> bool {
        self.reserved.is_set(index)
    }

    pub fn all_reserved(&self, first: usize, count: usize) -> bool {
        self.reserved.all_set(first, count)
    }

    /// Points `[first, first + count)` back at scratch and drops the
    /// reservation. Returns `true` if the table is now unused.
    pub fn release_slots(&mut self, first: usize, count: usize, scratch_pte: u64) -> bool {
        self.reserved.update(first, count, false);
        for i in first..first + count {
            self.width.write(&mut self.page, i, scratch_pte);
        }
        self.reserved.count() == 0
    }

    #[inline]
    pub fn read(&self, index: usize) -> u64 {
        self.width.read(&self.page, index)
    }

    #[inline]
    pub fn write(&mut self, index: usize, value: u64) {
        self.width.write(&mut self.page, index, value);
    }

    /// Rewrites every slot with the scratch PTE.
    pub fn reset(&mut self, scratch_pte: u64) {
        self.width.fill(&mut self.page, scratch_pte);
    }
}

/// Interior node with children of type `C`.
pub(crate) struct Directory<C> {
    page: TablePage,
    width: Width,
    used: usize,
    children: Box<[Option<Box<C>>]>,
}

impl<C> Directory<C> {
    pub fn alloc(
        pages: &Arc<PageAllocator>,
        width: Width,
        slots: usize,
        scratch_entry: u64,
    ) -> Result<Box<Self>, GttError> {
        let mut page = pages.acquire()?;
        width.fill(&mut page, scratch_entry);
        let children: Vec<Option<Box<C>>> = (0..slots).map(|_| None).collect();
        Ok(Box::new(Self {
            page,
            width,
            used: 0,
            children: children.into_boxed_slice(),
        }))
    }

    #[inline]
    pub fn dma(&self) -> DmaAddress {
        self.page.dma()
    }

    /// Populated child slots.
    pub const fn used(&self) -> usize {
        self.used
    }

    pub const fn slots(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn child(&self, index: usize) -> Option<&C> {
        self.children.get(index)?.as_deref()
    }

    #[inline]
    pub fn child_mut(&mut self, index: usize) -> Option<&mut C> {
        self.children.get_mut(index)?.as_deref_mut()
    }

    pub fn children(&self) -> impl Iterator<Item = (usize, &C)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_deref().map(|c| (i, c)))
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = (usize, &mut C)> {
        self.children
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| c.as_deref_mut().map(|c| (i, c)))
    }

    /// The child at `index`, creating it with `make` if the slot still holds
    /// scratch. `make` returns the new child and the entry that points at it.
    /// The flag is `true` if a child was created.
    pub fn get_or_alloc(
        &mut self,
        index: usize,
        make: impl FnOnce() -> Result<(Box<C>, u64), GttError>,
    ) -> Result<(&mut C, bool), GttError> {
        let Self {
            page,
            width,
            used,
            children,
        } = self;
        let slot = &mut children[index];
        let (child, created) = match slot.take() {
            Some(child) => (child, false),
            None => {
                let (child, entry) = make()?;
                width.write(page, index, entry);
                *used += 1;
                (child, true)
            }
        };
        Ok((&mut **slot.insert(child), created))
    }

    /// Unlinks the child at `index` and points the slot back at scratch.
    pub fn remove(&mut self, index: usize, scratch_entry: u64) -> Option<Box<C>> {
        let child = self.children[index].take()?;
        self.width.write(&mut self.page, index, scratch_entry);
        self.used -= 1;
        Some(child)
    }

    #[inline]
    pub fn read(&self, index: usize) -> u64 {
        self.width.read(&self.page, index)
    }

    #[inline]
    pub fn write(&mut self, index: usize, value: u64) {
        self.width.write(&mut self.page, index, value);
    }
}
