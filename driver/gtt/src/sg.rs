//! Backing-page descriptions.

use crate::error::GttError;
use crate::page::PAGE_SIZE;
use alloc::vec::Vec;
use gtt_addresses::{DmaAddress, is_aligned};
use gtt_info::PageSizes;

/// One physically contiguous run of backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgChunk {
    pub dma: DmaAddress,
    pub length: u64,
}

/// An ordered list of DMA chunks backing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgTable {
    chunks: Vec<SgChunk>,
    length: u64,
}

impl SgTable {
    /// Every chunk must be non-empty and 4 KiB aligned in address and length.
    pub fn new(chunks: Vec<SgChunk>) -> Result<Self, GttError> {
        if chunks.is_empty() {
            return Err(GttError::InvalidPages { dma: 0, length: 0 });
        }
        let mut length = 0u64;
        for c in &chunks {
            if c.length == 0
                || c.dma.as_u64().checked_add(c.length).is_none()
                || !is_aligned(c.dma.as_u64(), PAGE_SIZE)
                || !is_aligned(c.length, PAGE_SIZE)
            {
                return Err(GttError::InvalidPages {
                    dma: c.dma.as_u64(),
                    length: c.length,
                });
            }
            length = length
                .checked_add(c.length)
                .ok_or(GttError::invalid(length, c.length))?;
        }
        Ok(Self { chunks, length })
    }

    pub fn contiguous(dma: DmaAddress, length: u64) -> Result<Self, GttError> {
        Self::new(alloc::vec![SgChunk { dma, length }])
    }

    /// Builds a table from individual 4 KiB pages, merging neighbours.
    pub fn from_pages(pages: impl IntoIterator<Item = DmaAddress>) -> Result<Self, GttError> {
        let mut chunks: Vec<SgChunk> = Vec::new();
        for dma in pages {
            match chunks.last_mut() {
                Some(last) if last.dma.as_u64().checked_add(last.length) == Some(dma.as_u64()) => {
                    last.length += PAGE_SIZE;
                }
                _ => chunks.push(SgChunk {
                    dma,
                    length: PAGE_SIZE,
                }),
            }
        }
        Self::new(chunks)
    }

    #[must_use]
    pub fn chunks(&self) -> &[SgChunk] {
        &self.chunks
    }

    /// Total bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.length / PAGE_SIZE
    }

    /// Every 4 KiB page in order.
    pub fn pages(&self) -> impl Iterator<Item = DmaAddress> + '_ {
        self.chunks.iter().flat_map(|c| {
            (0..c.length / PAGE_SIZE).map(move |i| c.dma + i * PAGE_SIZE)
        })
    }

    /// OR of all chunk lengths.
    #[must_use]
    pub fn phys_sizes(&self) -> u64 {
        self.chunks.iter().fold(0, |acc, c| acc | c.length)
    }

    /// Leaf sizes from `supported` that some chunk is long enough to use.
    #[must_use]
    pub fn gtt_page_sizes(&self, supported: PageSizes) -> PageSizes {
        let phys = self.phys_sizes();
        supported
            .iter()
            .filter(|size| phys & !(u64::from(size.bits()) - 1) != 0)
            .collect()
    }

    pub(crate) fn cursor(&self) -> SgCursor<'_> {
        SgCursor::new(&self.chunks)
    }
}

/// Outcome of [`SgCursor::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    SameChunk,
    NextChunk,
    Done,
}

/// Position inside an [`SgTable`].
pub(crate) struct SgCursor<'a> {
    chunks: &'a [SgChunk],
    index: usize,
    dma: u64,
    end: u64,
}

impl<'a> SgCursor<'a> {
    fn new(chunks: &'a [SgChunk]) -> Self {
        let (dma, end) = chunks
            .first()
            .map_or((0, 0), |c| (c.dma.as_u64(), c.dma.as_u64() + c.length));
        Self {
            chunks,
            index: 0,
            dma,
            end,
        }
    }

    #[inline]
    pub const fn dma(&self) -> u64 {
        self.dma
    }

    /// Bytes left in the current chunk.
    #[inline]
    pub const fn remaining(&self) -> u64 {
        self.end - self.dma
    }

    #[inline]
    pub const fn is_done(&self) -> bool {
        self.index >= self.chunks.len()
    }

    /// Moves `bytes` forward; must not cross the end of the current chunk.
    pub fn advance(&mut self, bytes: u64) -> Step {
        self.dma += bytes;
        if self.dma < self.end {
            return Step::SameChunk;
        }
        self.index += 1;
        match self.chunks.get(self.index) {
            Some(c) => {
                self.dma = c.dma.as_u64();
                self.end = self.dma + c.length;
                Step::NextChunk
            }
            None => {
                self.end = self.dma;
                Step::Done
            }
        }
    }
}
