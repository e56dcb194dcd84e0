use super::{Insert, PTE_SHIFT};
use crate::error::GttError;
use crate::gsm::GsmWindow;
use alloc::boxed::Box;

/// The global GTT: one PTE per 4 KiB page, written through a window onto
/// device memory.
pub(crate) struct FlatTable {
    gsm: Box<dyn GsmWindow>,
}

impl FlatTable {
    pub(crate) fn new(gsm: Box<dyn GsmWindow>) -> Self {
        Self { gsm }
    }

    /// Bytes of address space described.
    pub(crate) fn total(&self) -> u64 {
        self.gsm.entries() << PTE_SHIFT
    }

    pub(crate) fn entries(&self) -> u64 {
        self.gsm.entries()
    }

    pub(crate) fn clear(&mut self, scratch_pte: u64, start: u64, length: u64) {
        let first = start >> PTE_SHIFT;
        for index in first..first + (length >> PTE_SHIFT) {
            self.gsm.write_entry(index, scratch_pte);
        }
    }

    pub(crate) fn insert(&mut self, req: &Insert<'_>) -> Result<(), GttError> {
        let first = req.start >> PTE_SHIFT;
        if first + req.pages.page_count() > self.gsm.entries() {
            return Err(GttError::invalid(req.start, req.pages.len()));
        }
        for (index, dma) in (first..).zip(req.pages.pages()) {
            self.gsm.write_entry(index, req.encoder.encode(dma.as_u64()));
        }
        Ok(())
    }

    pub(crate) fn read(&self, index: u64) -> Option<u64> {
        (index < self.gsm.entries()).then(|| self.gsm.read_entry(index))
    }
}
