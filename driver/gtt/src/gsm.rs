//! The GGTT's backing store.

use crate::page::PAGE_SIZE;
use alloc::vec;
use alloc::vec::Vec;

/// CPU window onto the global GTT's PTE array (the graphics stolen memory).
///
/// On real hardware this is a write-combined BAR mapping: writes may sit in
/// CPU buffers until the GGTT is invalidated, and the device may still use
/// stale entries until then.
pub trait GsmWindow: Send {
    /// Number of PTE slots.
    fn entries(&self) -> u64;
    fn write_entry(&mut self, index: u64, entry: u64);
    fn read_entry(&self, index: u64) -> u64;
}

/// A GGTT table held in ordinary memory, with no write buffering.
#[derive(Debug, Clone)]
pub struct LocalGsm {
    entries: Vec<u64>,
}

impl LocalGsm {
    #[must_use]
    pub fn new(entries: usize) -> Self {
        Self {
            entries: vec![0; entries],
        }
    }

    /// A table covering `size` bytes of GGTT, e.g. [`GttConfig::ggtt_size`].
    ///
    /// [`GttConfig::ggtt_size`]: gtt_info::GttConfig::ggtt_size
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn spanning(size: u64) -> Self {
        Self::new((size / PAGE_SIZE) as usize)
    }
}

impl GsmWindow for LocalGsm {
    fn entries(&self) -> u64 {
        self.entries.len() as u64
    }

    fn write_entry(&mut self, index: u64, entry: u64) {
        if let Some(slot) = usize::try_from(index).ok().and_then(|i| self.entries.get_mut(i)) {
            *slot = entry;
        }
    }

    fn read_entry(&self, index: u64) -> u64 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .copied()
            .unwrap_or(0)
    }
}
