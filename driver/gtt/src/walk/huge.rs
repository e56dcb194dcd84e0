//! Leaf promotion on 4-level trees.
//!
//! A page table whose 512 PTEs map one 2 MiB-aligned, 2 MiB-contiguous run
//! is bypassed: its PDE becomes a 2 MiB leaf. The table itself is still
//! filled with the equivalent 4 KiB entries, so a later partial clear can
//! fall back to it by rewriting the PDE alone.
//!
//! A table written entirely with 64 KiB-aligned, 64 KiB-contiguous runs gets
//! the IPS hint on its PDE, and the walker then only looks at every 16th
//! entry. The hint is also set on a short final table when the scratch page
//! is 64 KiB and the reserved node runs to the end of the 2 MiB region, since
//! then the unused tail walks into scratch in 64 KiB steps too.

use super::gen8::{pde_index, pte_index};
use super::{GEN8_PDPE_SHIFT, GEN8_PML4E_SHIFT, Insert, PTE_SHIFT, Pml4, Walk, index_of, plain_pde};
use crate::entry::Gen8Entry;
use crate::error::GttError;
use crate::sg::Step;
use gtt_addresses::is_aligned;
use gtt_info::GEN8_ENTRIES;
use gtt_info::PageSizes;

const PAGE: u64 = 1 << PTE_SHIFT;
const SIZE_64K: u64 = 64 << 10;
const SIZE_2M: u64 = 2 << 20;

/// A run of `rem` bytes at `dma` can keep filling a table in 64 KiB steps
/// from entry `index` on.
const fn fits_64k(dma: u64, rem: u64, index: usize) -> bool {
    is_aligned(dma, SIZE_64K)
        && (is_aligned(rem, SIZE_64K) || rem >= (GEN8_ENTRIES - index) as u64 * PAGE)
}

pub(super) fn insert(w: &Walk<'_>, pml4: &mut Pml4, req: &Insert<'_>) -> Result<(), GttError> {
    let use_2m = req.page_sizes.contains(PageSizes::SIZE_2M);
    let use_64k = req.page_sizes.contains(PageSizes::SIZE_64K);
    let missing = |addr: u64| GttError::invalid(addr, PAGE);

    let mut cursor = req.pages.cursor();
    let mut addr = req.start;

    while !cursor.is_done() {
        let pd = pml4
            .child_mut(index_of(addr, GEN8_PML4E_SHIFT, GEN8_ENTRIES))
            .and_then(|pdp| pdp.child_mut(index_of(addr, GEN8_PDPE_SHIFT, GEN8_ENTRIES)))
            .ok_or_else(|| missing(addr))?;
        let pde = pde_index(addr);
        let mut index = pte_index(addr);
        let pt = pd.child_mut(pde).ok_or_else(|| missing(addr))?;

        let dma = cursor.dma();
        if use_2m && index == 0 && is_aligned(dma, SIZE_2M) && cursor.remaining() >= SIZE_2M {
            for i in 0..GEN8_ENTRIES {
                pt.write(i, req.encoder.encode(dma + i as u64 * PAGE));
            }
            let leaf = Gen8Entry::from_bits(req.encoder.encode(dma)).with_page_size_2m(true);
            pd.write(pde, leaf.into_bits());
            addr += SIZE_2M;
            cursor.advance(SIZE_2M);
            continue;
        }

        let mut maybe_64k = use_64k && index == 0 && fits_64k(dma, cursor.remaining(), index);
        loop {
            pt.write(index, req.encoder.encode(cursor.dma()));
            index += 1;
            addr += PAGE;
            match cursor.advance(PAGE) {
                Step::Done => break,
                Step::NextChunk => {
                    if maybe_64k && index < GEN8_ENTRIES {
                        maybe_64k = fits_64k(cursor.dma(), cursor.remaining(), index);
                    }
                }
                Step::SameChunk => {}
            }
            if index == GEN8_ENTRIES {
                break;
            }
        }

        let ips = maybe_64k
            && (index == GEN8_ENTRIES
                || (w.scratch.is_64k() && cursor.is_done() && is_aligned(req.node_end, SIZE_2M)));
        let entry = Gen8Entry::from_bits(plain_pde(pt)).with_ips_64k(ips).into_bits();
        if pd.read(pde) != entry {
            pd.write(pde, entry);
        }
    }
    Ok(())
}
