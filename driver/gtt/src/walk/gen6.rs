//! Gen6/7 two-level tree: one root directory of 1024-entry page tables with
//! 32-bit entries.

use super::{GEN6_PDE_SHIFT, Insert, PTE_SHIFT, PageDirectory, SlotIter, Walk, index_of, pte_count};
use crate::entry::Gen6Entry;
use crate::error::GttError;
use crate::node::{Directory, PageTable, Width};
use crate::sg::Step;
use alloc::boxed::Box;
use gtt_info::{GEN6_PDES, GEN6_PTES};

const PAGE: u64 = 1 << PTE_SHIFT;

#[inline]
const fn pte_index(addr: u64) -> usize {
    index_of(addr, PTE_SHIFT, GEN6_PTES)
}

fn pde_for(pt: &PageTable) -> u64 {
    u64::from(Gen6Entry::pde(pt.dma()).into_bits())
}

pub(super) fn new_root(w: &Walk<'_>, total: u64) -> Result<Box<PageDirectory>, GttError> {
    #[allow(clippy::cast_possible_truncation)]
    let slots = ((total >> GEN6_PDE_SHIFT) as usize).clamp(1, GEN6_PDES);
    Directory::alloc(w.pages, Width::U32, slots, w.scratch.pde)
}

fn new_pt(w: &Walk<'_>) -> Result<(Box<PageTable>, u64), GttError> {
    let pt = PageTable::alloc(w.pages, Width::U32, GEN6_PTES, w.scratch.pte)?;
    let entry = pde_for(&pt);
    Ok((pt, entry))
}

pub(super) fn alloc(w: &Walk<'_>, pd: &mut PageDirectory, start: u64, length: u64) -> Result<(), GttError> {
    for s in SlotIter::new(start, length, GEN6_PDE_SHIFT, pd.slots()) {
        let res = pd.get_or_alloc(s.index, || new_pt(w)).map(|(pt, created)| {
            pt.reserve(pte_index(s.start), pte_count(s.length));
            created
        });
        match res {
            Ok(true) => w.mark_dirty(),
            Ok(false) => {}
            Err(e) => {
                clear(w, pd, start, s.start - start);
                return Err(e);
            }
        }
    }
    Ok(())
}

pub(super) fn clear(w: &Walk<'_>, pd: &mut PageDirectory, start: u64, length: u64) {
    for s in SlotIter::new(start, length, GEN6_PDE_SHIFT, pd.slots()) {
        let emptied = pd
            .child_mut(s.index)
            .is_some_and(|pt| pt.release_slots(pte_index(s.start), pte_count(s.length), w.scratch.pte));
        if emptied {
            drop(pd.remove(s.index, w.scratch.pde));
            w.mark_dirty();
        }
    }
}

pub(super) fn insert(pd: &mut PageDirectory, req: &Insert<'_>) -> Result<(), GttError> {
    let mut cursor = req.pages.cursor();
    let mut addr = req.start;
    loop {
        let pde = index_of(addr, GEN6_PDE_SHIFT, pd.slots());
        let pt = pd
            .child_mut(pde)
            .ok_or(GttError::invalid(addr, PAGE))?;
        let mut pte = pte_index(addr);
        while pte < GEN6_PTES {
            pt.write(pte, req.encoder.encode(cursor.dma()));
            pte += 1;
            addr += PAGE;
            if cursor.advance(PAGE) == Step::Done {
                return Ok(());
            }
        }
    }
}

pub(super) fn is_allocated(pd: &PageDirectory, start: u64, length: u64) -> bool {
    SlotIter::new(start, length, GEN6_PDE_SHIFT, pd.slots()).all(|s| {
        pd.child(s.index)
            .is_some_and(|pt| pt.all_reserved(pte_index(s.start), pte_count(s.length)))
    })
}

pub(super) fn reset(w: &Walk<'_>, pd: &mut PageDirectory) {
    for i in 0..pd.slots() {
        let entry = match pd.child_mut(i) {
            Some(pt) => {
                pt.reset(w.scratch.pte);
                pde_for(pt)
            }
            None => w.scratch.pde,
        };
        pd.write(i, entry);
    }
}

pub(super) fn read_pte(pd: &PageDirectory, addr: u64) -> Option<u64> {
    pd.child(index_of(addr, GEN6_PDE_SHIFT, pd.slots()))
        .map(|pt| pt.read(pte_index(addr)))
}
