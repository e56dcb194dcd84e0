use crate::error::GttError;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use gtt_addresses::GttRange;

/// First-fit allocator of GTT address ranges.
///
/// Nodes never overlap and are kept sorted by start address.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    start: u64,
    end: u64,
    nodes: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Lowest hole that fits `size` bytes at `alignment`, a power of two no
    /// larger than the managed span. Zero means unaligned.
    pub fn insert(&mut self, size: u64, alignment: u64) -> Result<GttRange, GttError> {
        let alignment = alignment.max(1);
        if size == 0
            || !alignment.is_power_of_two()
            || alignment > self.end.saturating_sub(self.start)
        {
            return Err(GttError::invalid(self.start, size));
        }
        let mut cursor = self.start;
        let mut found = None;
        for (&s, &len) in &self.nodes {
            if let Some(at) = fit(cursor, s, size, alignment) {
                found = Some(at);
                break;
            }
            cursor = cursor.max(s + len);
        }
        let at = found
            .or_else(|| fit(cursor, self.end, size, alignment))
            .ok_or(GttError::NoSpace)?;
        self.nodes.insert(at, size);
        Ok(GttRange::from_raw(at, size))
    }

    /// Claims exactly `range`.
    pub fn reserve(&mut self, range: GttRange) -> Result<(), GttError> {
        let (s, len) = (range.start().as_u64(), range.len());
        if len == 0 || s < self.start || s.checked_add(len).is_none_or(|e| e > self.end) {
            return Err(GttError::invalid(s, len));
        }
        if !self.overlapping(range).is_empty() {
            return Err(GttError::collision(&range));
        }
        self.nodes.insert(s, len);
        Ok(())
    }

    /// Frees the node starting at `start`.
    pub fn remove(&mut self, start: u64) -> Option<GttRange> {
        self.nodes
            .remove(&start)
            .map(|len| GttRange::from_raw(start, len))
    }

    /// Nodes intersecting `range`, lowest first.
    #[must_use]
    pub fn overlapping(&self, range: GttRange) -> Vec<GttRange> {
        let lo = range.start().as_u64();
        let mut hits: Vec<GttRange> = self
            .nodes
            .range(..range.end().as_u64())
            .rev()
            .take_while(|&(&s, &len)| s + len > lo)
            .map(|(&s, &len)| GttRange::from_raw(s, len))
            .collect();
        hits.reverse();
        hits
    }

    pub fn iter(&self) -> impl Iterator<Item = GttRange> + '_ {
        self.nodes.iter().map(|(&s, &len)| GttRange::from_raw(s, len))
    }
}

fn fit(lo: u64, hi: u64, size: u64, alignment: u64) -> Option<u64> {
    let at = lo.checked_add(alignment - 1)? & !(alignment - 1);
    (at.checked_add(size)? <= hi).then_some(at)
}
