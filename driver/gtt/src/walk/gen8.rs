//! Gen8 3- and 4-level trees with 4 KiB leaves.

use super::{
    GEN8_PDE_SHIFT, GEN8_PDPE_SHIFT, GEN8_PML4E_SHIFT, Insert, NodeCount, PTE_SHIFT, PageDirectory,
    Pdp, Pml4, Slot, SlotIter, Walk, index_of, plain_pde, pte_count,
};
use crate::entry::Gen8Entry;
use crate::error::GttError;
use crate::node::{Directory, PageTable, Width};
use crate::sg::{SgCursor, Step};
use alloc::boxed::Box;
use gtt_addresses::is_aligned;
use gtt_info::GEN8_ENTRIES;
use log::trace;

const PAGE: u64 = 1 << PTE_SHIFT;
const SIZE_64K: u64 = 64 << 10;
const PDP_SPAN: u64 = 1 << GEN8_PML4E_SHIFT;

#[inline]
pub(super) const fn pte_index(addr: u64) -> usize {
    index_of(addr, PTE_SHIFT, GEN8_ENTRIES)
}

#[inline]
pub(super) const fn pde_index(addr: u64) -> usize {
    index_of(addr, GEN8_PDE_SHIFT, GEN8_ENTRIES)
}

pub(super) fn new_pt(w: &Walk<'_>) -> Result<(Box<PageTable>, u64), GttError> {
    let pt = PageTable::alloc(w.pages, Width::U64, GEN8_ENTRIES, w.scratch.pte)?;
    let entry = plain_pde(&pt);
    Ok((pt, entry))
}

pub(super) fn new_pd(w: &Walk<'_>) -> Result<(Box<PageDirectory>, u64), GttError> {
    let pd = Directory::alloc(w.pages, Width::U64, GEN8_ENTRIES, w.scratch.pde)?;
    let entry = Gen8Entry::pde(pd.dma()).into_bits();
    Ok((pd, entry))
}

pub(super) fn new_pdp(w: &Walk<'_>, slots: usize) -> Result<(Box<Pdp>, u64), GttError> {
    let pdp = Directory::alloc(w.pages, Width::U64, slots, w.scratch.pdpe)?;
    let entry = Gen8Entry::pde(pdp.dma()).into_bits();
    Ok((pdp, entry))
}

pub(super) fn new_pml4(w: &Walk<'_>) -> Result<Box<Pml4>, GttError> {
    Directory::alloc(w.pages, Width::U64, GEN8_ENTRIES, w.scratch.pml4e)
}

/// Drops the child at `index` if it is unused.
fn release_if_empty<C>(w: &Walk<'_>, dir: &mut Directory<Directory<C>>, index: usize, scratch: u64) {
    if dir.child(index).is_some_and(|c| c.used() == 0) {
        drop(dir.remove(index, scratch));
        w.mark_dirty();
    }
}

pub(super) fn alloc_pd(
    w: &Walk<'_>,
    pd: &mut PageDirectory,
    start: u64,
    length: u64,
) -> Result<(), GttError> {
    for s in SlotIter::new(start, length, GEN8_PDE_SHIFT, pd.slots()) {
        let res = pd
            .get_or_alloc(s.index, || new_pt(w))
            .map(|(pt, _)| pt.reserve(pte_index(s.start), pte_count(s.length)));
        if let Err(e) = res {
            clear_pd(w, pd, start, s.start - start);
            return Err(e);
        }
    }
    Ok(())
}

pub(super) fn alloc_pdp(w: &Walk<'_>, pdp: &mut Pdp, start: u64, length: u64) -> Result<(), GttError> {
    for s in SlotIter::new(start, length, GEN8_PDPE_SHIFT, pdp.slots()) {
        let res = pdp.get_or_alloc(s.index, || new_pd(w)).and_then(|(pd, created)| {
            if created {
                w.mark_dirty();
            }
            alloc_pd(w, pd, s.start, s.length)
        });
        if let Err(e) = res {
            release_if_empty(w, pdp, s.index, w.scratch.pdpe);
            clear_pdp(w, pdp, start, s.start - start);
            return Err(e);
        }
    }
    Ok(())
}

pub(super) fn alloc_pml4(
    w: &Walk<'_>,
    pml4: &mut Pml4,
    start: u64,
    length: u64,
) -> Result<(), GttError> {
    for s in SlotIter::new(start, length, GEN8_PML4E_SHIFT, pml4.slots()) {
        let res = pml4
            .get_or_alloc(s.index, || new_pdp(w, GEN8_ENTRIES))
            .and_then(|(pdp, _)| alloc_pdp(w, pdp, s.start, s.length));
        if let Err(e) = res {
            release_if_empty(w, pml4, s.index, w.scratch.pml4e);
            clear_pml4(w, pml4, start, s.start - start);
            return Err(e);
        }
    }
    Ok(())
}

/// Returns `true` if the directory ended up empty.
pub(super) fn clear_pd(w: &Walk<'_>, pd: &mut PageDirectory, start: u64, length: u64) -> bool {
    for s in SlotIter::new(start, length, GEN8_PDE_SHIFT, pd.slots()) {
        let Some(pt) = pd.child_mut(s.index) else {
            continue;
        };
        if pt.release_slots(pte_index(s.start), pte_count(s.length), w.scratch.pte) {
            trace!("freeing page table at {:#x}", s.start);
            drop(pd.remove(s.index, w.scratch.pde));
        } else {
            fix_partial_pde(w, pd, s);
        }
    }
    pd.used() == 0
}

/// A PDE over a partially cleared table may no longer describe it: a 2 MiB
/// leaf falls back to the table, and the 64 KiB hint survives only when the
/// cleared part is whole 64 KiB pages backed by a 64 KiB scratch page.
fn fix_partial_pde(w: &Walk<'_>, pd: &mut PageDirectory, s: Slot) {
    let Some(pt) = pd.child(s.index) else {
        return;
    };
    let plain = plain_pde(pt);
    let pde = Gen8Entry::from_bits(pd.read(s.index));
    let keep_ips = w.scratch.is_64k() && is_aligned(s.start, SIZE_64K) && is_aligned(s.length, SIZE_64K);
    if pde.page_size_2m() || (pde.ips_64k() && !keep_ips) {
        pd.write(s.index, plain);
    }
}

pub(super) fn clear_pdp(w: &Walk<'_>, pdp: &mut Pdp, start: u64, length: u64) -> bool {
    for s in SlotIter::new(start, length, GEN8_PDPE_SHIFT, pdp.slots()) {
        let Some(pd) = pdp.child_mut(s.index) else {
            continue;
        };
        if clear_pd(w, pd, s.start, s.length) {
            drop(pdp.remove(s.index, w.scratch.pdpe));
            w.mark_dirty();
        }
    }
    pdp.used() == 0
}

pub(super) fn clear_pml4(w: &Walk<'_>, pml4: &mut Pml4, start: u64, length: u64) {
    for s in SlotIter::new(start, length, GEN8_PML4E_SHIFT, pml4.slots()) {
        let Some(pdp) = pml4.child_mut(s.index) else {
            continue;
        };
        if clear_pdp(w, pdp, s.start, s.length) {
            drop(pml4.remove(s.index, w.scratch.pml4e));
        }
    }
}

fn missing(addr: u64) -> GttError {
    GttError::invalid(addr, PAGE)
}

/// Writes 4 KiB PTEs below one PDP until the pages run out or the walk
/// crosses into the next PDP. Returns `true` in the latter case.
fn insert_pdp(
    pdp: &mut Pdp,
    cursor: &mut SgCursor<'_>,
    addr: &mut u64,
    req: &Insert<'_>,
) -> Result<bool, GttError> {
    loop {
        let pde = pde_index(*addr);
        let pdpe = index_of(*addr, GEN8_PDPE_SHIFT, pdp.slots());
        let pd = pdp.child_mut(pdpe).ok_or_else(|| missing(*addr))?;
        let pt = pd.child_mut(pde).ok_or_else(|| missing(*addr))?;

        let mut pte = pte_index(*addr);
        let mut done = false;
        while pte < GEN8_ENTRIES {
            pt.write(pte, req.encoder.encode(cursor.dma()));
            pte += 1;
            *addr += PAGE;
            if cursor.advance(PAGE) == Step::Done {
                done = true;
                break;
            }
        }

        // 4K leaves were written; stale leaf-size hints must go.
        let plain = plain_pde(pt);
        if pd.read(pde) != plain {
            pd.write(pde, plain);
        }

        if done {
            return Ok(false);
        }
        if *addr % PDP_SPAN == 0 {
            return Ok(true);
        }
    }
}

pub(super) fn insert_3lvl(pdp: &mut Pdp, req: &Insert<'_>) -> Result<(), GttError> {
    let mut cursor = req.pages.cursor();
    let mut addr = req.start;
    if insert_pdp(pdp, &mut cursor, &mut addr, req)? {
        return Err(missing(addr));
    }
    Ok(())
}

pub(super) fn insert_4lvl(pml4: &mut Pml4, req: &Insert<'_>) -> Result<(), GttError> {
    let mut cursor = req.pages.cursor();
    let mut addr = req.start;
    loop {
        let pdp = pml4
            .child_mut(index_of(addr, GEN8_PML4E_SHIFT, GEN8_ENTRIES))
            .ok_or_else(|| missing(addr))?;
        if !insert_pdp(pdp, &mut cursor, &mut addr, req)? {
            return Ok(());
        }
    }
}

pub(super) fn pd_is_allocated(pd: &PageDirectory, start: u64, length: u64) -> bool {
    SlotIter::new(start, length, GEN8_PDE_SHIFT, pd.slots()).all(|s| {
        pd.child(s.index)
            .is_some_and(|pt| pt.all_reserved(pte_index(s.start), pte_count(s.length)))
    })
}

pub(super) fn pdp_is_allocated(pdp: &Pdp, start: u64, length: u64) -> bool {
    SlotIter::new(start, length, GEN8_PDPE_SHIFT, pdp.slots()).all(|s| {
        pdp.child(s.index)
            .is_some_and(|pd| pd_is_allocated(pd, s.start, s.length))
    })
}

pub(super) fn pml4_is_allocated(pml4: &Pml4, start: u64, length: u64) -> bool {
    SlotIter::new(start, length, GEN8_PML4E_SHIFT, pml4.slots()).all(|s| {
        pml4.child(s.index)
            .is_some_and(|pdp| pdp_is_allocated(pdp, s.start, s.length))
    })
}

fn reset_pd(w: &Walk<'_>, pd: &mut PageDirectory) {
    for i in 0..pd.slots() {
        let entry = match pd.child_mut(i) {
            Some(pt) => {
                pt.reset(w.scratch.pte);
                plain_pde(pt)
            }
            None => w.scratch.pde,
        };
        pd.write(i, entry);
    }
}

pub(super) fn reset_pdp(w: &Walk<'_>, pdp: &mut Pdp) {
    for i in 0..pdp.slots() {
        let entry = match pdp.child_mut(i) {
            Some(pd) => {
                reset_pd(w, pd);
                Gen8Entry::pde(pd.dma()).into_bits()
            }
            None => w.scratch.pdpe,
        };
        pdp.write(i, entry);
    }
}

pub(super) fn reset_pml4(w: &Walk<'_>, pml4: &mut Pml4) {
    for i in 0..pml4.slots() {
        let entry = match pml4.child_mut(i) {
            Some(pdp) => {
                reset_pdp(w, pdp);
                Gen8Entry::pde(pdp.dma()).into_bits()
            }
            None => w.scratch.pml4e,
        };
        pml4.write(i, entry);
    }
}

/// `(pde, pte)` for `addr` if a page table covers it.
pub(super) fn pdp_leaf(pdp: &Pdp, addr: u64) -> Option<(u64, u64)> {
    let pd = pdp.child(index_of(addr, GEN8_PDPE_SHIFT, pdp.slots()))?;
    let pde = pde_index(addr);
    let pt = pd.child(pde)?;
    Some((pd.read(pde), pt.read(pte_index(addr))))
}

pub(super) fn pml4_leaf(pml4: &Pml4, addr: u64) -> Option<(u64, u64)> {
    pdp_leaf(pml4.child(index_of(addr, GEN8_PML4E_SHIFT, GEN8_ENTRIES))?, addr)
}

pub(super) fn count_pdp(pdp: &Pdp, n: &mut NodeCount) {
    for (_, pd) in pdp.children() {
        n.pd += 1;
        n.pt += pd.used();
    }
}
