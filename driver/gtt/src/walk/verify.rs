//! Consistency checks and human-readable dumps of a table tree.

use super::{
    GEN6_PDE_SHIFT, GEN8_PDE_SHIFT, GEN8_PDPE_SHIFT, GEN8_PML4E_SHIFT, Layout, PTE_SHIFT,
    PageDirectory, Pdp, Walk, plain_pde,
};
use crate::entry::{Gen6Entry, Gen8Entry, PteFormat};
use crate::node::PageTable;
use alloc::vec::Vec;
use core::fmt;
use gtt_addresses::{GttAddress, GttRange};

/// Tree level an inconsistency was found at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Ggtt,
    Pml4,
    Pdp,
    Pd,
    Pt,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ggtt => "ggtt",
            Self::Pml4 => "pml4",
            Self::Pdp => "pdp",
            Self::Pd => "pd",
            Self::Pt => "pt",
        })
    }
}

/// Something in the tree that does not match the bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// A slot holds neither what its node records nor scratch.
    BadEntry {
        level: Level,
        address: GttAddress,
        index: usize,
        found: u64,
        expected: u64,
    },
    /// A non-root node with no users is still linked.
    EmptyNode { level: Level, address: GttAddress },
    /// A recorded binding whose range is not fully backed by tables.
    Unbacked { range: GttRange },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEntry {
                level,
                address,
                index,
                found,
                expected,
            } => write!(
                f,
                "{level}[{index}] covering {address}: found {found:#x}, expected {expected:#x}"
            ),
            Self::EmptyNode { level, address } => {
                write!(f, "empty {level} covering {address} left linked")
            }
            Self::Unbacked { range } => write!(f, "binding {range} is not backed by page tables"),
        }
    }
}

struct Checker<'a> {
    format: PteFormat,
    scratch_pte: u64,
    out: &'a mut Vec<Inconsistency>,
}

impl Checker<'_> {
    fn bad(&mut self, level: Level, base: u64, index: usize, found: u64, expected: u64) {
        self.out.push(Inconsistency::BadEntry {
            level,
            address: GttAddress::new(base),
            index,
            found,
            expected,
        });
    }

    fn empty(&mut self, level: Level, base: u64) {
        self.out.push(Inconsistency::EmptyNode {
            level,
            address: GttAddress::new(base),
        });
    }

    fn pt(&mut self, pt: &PageTable, base: u64) {
        if pt.used() == 0 {
            self.empty(Level::Pt, base);
        }
        for i in 0..pt.slots() {
            let e = pt.read(i);
            if e == self.scratch_pte {
                continue;
            }
            if self.format.decode(e).is_none() || !pt.is_reserved(i) {
                let addr = base + ((i as u64) << PTE_SHIFT);
                self.bad(Level::Pt, addr, i, e, self.scratch_pte);
            }
        }
    }

    fn gen8_pd(&mut self, pd: &PageDirectory, base: u64, scratch_pde: u64) {
        for i in 0..pd.slots() {
            let e = pd.read(i);
            let addr = base + ((i as u64) << GEN8_PDE_SHIFT);
            let Some(pt) = pd.child(i) else {
                if e != scratch_pde {
                    self.bad(Level::Pd, addr, i, e, scratch_pde);
                }
                continue;
            };
            let plain = plain_pde(pt);
            let raw = Gen8Entry::from_bits(e);
            let ok = if raw.page_size_2m() {
                raw.present() && Gen8Entry::from_bits(pt.read(0)).address() == raw.address()
            } else {
                raw.with_ips_64k(false).into_bits() == plain
            };
            if !ok {
                self.bad(Level::Pd, addr, i, e, plain);
            }
            self.pt(pt, addr);
        }
    }

    fn gen8_pdp(&mut self, pdp: &Pdp, base: u64, w: &Walk<'_>) {
        for i in 0..pdp.slots() {
            let e = pdp.read(i);
            let addr = base + ((i as u64) << GEN8_PDPE_SHIFT);
            match pdp.child(i) {
                None if e != w.scratch.pdpe => self.bad(Level::Pdp, addr, i, e, w.scratch.pdpe),
                None => {}
                Some(pd) => {
                    let link = Gen8Entry::pde(pd.dma()).into_bits();
                    if e != link {
                        self.bad(Level::Pdp, addr, i, e, link);
                    }
                    if pd.used() == 0 {
                        self.empty(Level::Pd, addr);
                    }
                    self.gen8_pd(pd, addr, w.scratch.pde);
                }
            }
        }
    }
}

pub(super) fn verify(layout: &Layout, w: &Walk<'_>, format: PteFormat) -> Vec<Inconsistency> {
    let mut out = Vec::new();
    let mut c = Checker {
        format,
        scratch_pte: w.scratch.pte,
        out: &mut out,
    };
    match layout {
        Layout::Flat(table) => {
            for index in 0..table.entries() {
                let e = table.read(index).unwrap_or(0);
                if e != c.scratch_pte && format.decode(e).is_none() {
                    #[allow(clippy::cast_possible_truncation)]
                    c.bad(Level::Ggtt, index << PTE_SHIFT, index as usize, e, c.scratch_pte);
                }
            }
        }
        Layout::TwoLevel(pd) => {
            for i in 0..pd.slots() {
                let e = pd.read(i);
                let addr = (i as u64) << GEN6_PDE_SHIFT;
                match pd.child(i) {
                    None if e != w.scratch.pde => c.bad(Level::Pd, addr, i, e, w.scratch.pde),
                    None => {}
                    Some(pt) => {
                        let link = u64::from(Gen6Entry::pde(pt.dma()).into_bits());
                        if e != link {
                            c.bad(Level::Pd, addr, i, e, link);
                        }
                        c.pt(pt, addr);
                    }
                }
            }
        }
        Layout::ThreeLevel(pdp) => c.gen8_pdp(pdp, 0, w),
        Layout::FourLevel(pml4) => {
            for i in 0..pml4.slots() {
                let e = pml4.read(i);
                let addr = (i as u64) << GEN8_PML4E_SHIFT;
                match pml4.child(i) {
                    None if e != w.scratch.pml4e => c.bad(Level::Pml4, addr, i, e, w.scratch.pml4e),
                    None => {}
                    Some(pdp) => {
                        let link = Gen8Entry::pde(pdp.dma()).into_bits();
                        if e != link {
                            c.bad(Level::Pml4, addr, i, e, link);
                        }
                        if pdp.used() == 0 {
                            c.empty(Level::Pdp, addr);
                        }
                        c.gen8_pdp(pdp, addr, w);
                    }
                }
            }
        }
    }
    out
}

fn dump_pt(out: &mut dyn fmt::Write, pt: &PageTable, base: u64, depth: usize, scratch: u64) -> fmt::Result {
    let mut i = 0;
    while i < pt.slots() {
        if pt.read(i) == scratch {
            i += 1;
            continue;
        }
        let first = i;
        while i < pt.slots() && pt.read(i) != scratch {
            i += 1;
        }
        writeln!(
            out,
            "{:indent$}pte[{first}..{i}) {:#014x}: {:#x} .. {:#x}",
            "",
            base + ((first as u64) << PTE_SHIFT),
            pt.read(first),
            pt.read(i - 1),
            indent = depth * 2
        )?;
    }
    Ok(())
}

fn dump_pd(out: &mut dyn fmt::Write, pd: &PageDirectory, base: u64, depth: usize, scratch: u64) -> fmt::Result {
    for (i, pt) in pd.children() {
        let addr = base + ((i as u64) << GEN8_PDE_SHIFT);
        let pde = Gen8Entry::from_bits(pd.read(i));
        let hint = if pde.page_size_2m() {
            " 2M"
        } else if pde.ips_64k() {
            " 64K"
        } else {
            ""
        };
        writeln!(
            out,
            "{:indent$}pde[{i}] -> pt {} used {}{hint}",
            "",
            pt.dma(),
            pt.used(),
            indent = depth * 2
        )?;
        dump_pt(out, pt, addr, depth + 1, scratch)?;
    }
    Ok(())
}

fn dump_pdp(out: &mut dyn fmt::Write, pdp: &Pdp, base: u64, depth: usize, scratch: u64) -> fmt::Result {
    for (i, pd) in pdp.children() {
        writeln!(
            out,
            "{:indent$}pdpe[{i}] -> pd {} used {}",
            "",
            pd.dma(),
            pd.used(),
            indent = depth * 2
        )?;
        dump_pd(out, pd, base + ((i as u64) << GEN8_PDPE_SHIFT), depth + 1, scratch)?;
    }
    Ok(())
}

pub(super) fn dump(layout: &Layout, w: &Walk<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
    let scratch = w.scratch.pte;
    writeln!(out, "scratch page {} ({} bytes)", w.scratch.page_dma(), w.scratch.page_size())?;
    match layout {
        Layout::Flat(table) => {
            writeln!(out, "ggtt: {} entries", table.entries())?;
            let mut index = 0;
            while index < table.entries() {
                if table.read(index) == Some(scratch) {
                    index += 1;
                    continue;
                }
                let first = index;
                while index < table.entries() && table.read(index) != Some(scratch) {
                    index += 1;
                }
                writeln!(out, "  pte[{first}..{index})")?;
            }
            Ok(())
        }
        Layout::TwoLevel(pd) => {
            writeln!(out, "pd {} used {}", pd.dma(), pd.used())?;
            for (i, pt) in pd.children() {
                writeln!(out, "  pde[{i}] -> pt {} used {}", pt.dma(), pt.used())?;
                dump_pt(out, pt, (i as u64) << GEN6_PDE_SHIFT, 2, scratch)?;
            }
            Ok(())
        }
        Layout::ThreeLevel(pdp) => {
            writeln!(out, "pdp {} used {}", pdp.dma(), pdp.used())?;
            dump_pdp(out, pdp, 0, 1, scratch)
        }
        Layout::FourLevel(pml4) => {
            writeln!(out, "pml4 {} used {}", pml4.dma(), pml4.used())?;
            for (i, pdp) in pml4.children() {
                writeln!(out, "  pml4e[{i}] -> pdp {} used {}", pdp.dma(), pdp.used())?;
                dump_pdp(out, pdp, (i as u64) << GEN8_PML4E_SHIFT, 2, scratch)?;
            }
            Ok(())
        }
    }
}
