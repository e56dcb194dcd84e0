//! Hardware entry encodings.
//!
//! Gen8+ entries are 64 bits at every level of the tree:
//!
//! ```text
//!  63      48 47                      12 11  10..8  7   6 5  4   3   2  1  0
//! ┌──────────┬──────────────────────────┬───┬─────┬────┬───┬───┬───┬──┬──┬──┐
//! │ ignored  │ address[47:12]           │IPS│     │ PS │   │PCD│PWT│  │RW│P │
//! └──────────┴──────────────────────────┴───┴─────┴────┴───┴───┴───┴──┴──┴──┘
//! ```
//!
//! `PS` marks a PDE as a 2 MiB leaf; `IPS` marks a PDE whose page table is
//! walked in 64 KiB steps. Gen6/7 entries are 32 bits with the upper physical
//! address bits folded into bits 11:4.

use crate::CacheLevel;
use bitfield_struct::bitfield;
use gtt_addresses::DmaAddress;

/// A gen8+ PPGTT entry (PTE, PDE, PDPE or PML4E).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Gen8Entry {
    pub present: bool,
    pub writable: bool,
    #[bits(1)]
    __: u8,
    /// PWT
    pub write_through: bool,
    /// PCD
    pub cache_disable: bool,
    #[bits(2)]
    __: u8,
    /// PDE only: this entry maps a 2 MiB page directly.
    pub page_size_2m: bool,
    #[bits(3)]
    __: u8,
    /// PDE only: the referenced page table holds 64 KiB leaves.
    pub ips_64k: bool,
    #[bits(36)]
    frame: u64,
    #[bits(16)]
    __: u16,
}

impl Gen8Entry {
    #[inline]
    #[must_use]
    pub const fn address(self) -> DmaAddress {
        DmaAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_address(self, addr: DmaAddress) -> Self {
        self.with_frame(addr.as_u64() >> 12)
    }

    /// Leaf entry.
    #[must_use]
    pub const fn pte(addr: DmaAddress, cache: CacheLevel, read_only: bool) -> Self {
        let e = Self::new()
            .with_present(true)
            .with_writable(!read_only)
            .with_address(addr);
        match cache {
            CacheLevel::None => e.with_write_through(true).with_cache_disable(true),
            CacheLevel::Wt => e.with_cache_disable(true),
            CacheLevel::Llc | CacheLevel::L3Llc => e,
        }
    }

    /// Directory entry pointing at the next level.
    #[must_use]
    pub const fn pde(addr: DmaAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_address(addr)
    }

    /// Global GTT entry. Cacheability comes from the PAT, not the PTE.
    #[must_use]
    pub const fn ggtt_pte(addr: DmaAddress) -> Self {
        Self::new().with_present(true).with_address(addr)
    }
}

/// A gen6/7 PTE or PDE.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Gen6Entry {
    pub valid: bool,
    #[bits(3)]
    pub cache: u8,
    #[bits(8)]
    addr_hi: u8,
    #[bits(20)]
    addr_lo: u32,
}

impl Gen6Entry {
    pub const UNCACHED: u8 = 1;
    pub const LLC: u8 = 2;
    pub const L3_LLC: u8 = 3;

    #[must_use]
    pub const fn with_address(self, addr: DmaAddress) -> Self {
        let a = addr.as_u64();
        #[allow(clippy::cast_possible_truncation)]
        let lo = ((a >> 12) & 0xf_ffff) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let hi = ((a >> 32) & 0xff) as u8;
        self.with_addr_lo(lo).with_addr_hi(hi)
    }

    #[must_use]
    pub const fn address(self) -> DmaAddress {
        DmaAddress::new(((self.addr_hi() as u64) << 32) | ((self.addr_lo() as u64) << 12))
    }

    /// Sandybridge PTE: no separate L3 control.
    #[must_use]
    pub const fn snb(addr: DmaAddress, cache: CacheLevel) -> Self {
        let bits = match cache {
            CacheLevel::None => Self::UNCACHED,
            CacheLevel::Llc | CacheLevel::L3Llc | CacheLevel::Wt => Self::LLC,
        };
        Self::new().with_valid(true).with_cache(bits).with_address(addr)
    }

    /// Ivybridge PTE.
    #[must_use]
    pub const fn ivb(addr: DmaAddress, cache: CacheLevel) -> Self {
        let bits = match cache {
            CacheLevel::None => Self::UNCACHED,
            CacheLevel::L3Llc => Self::L3_LLC,
            CacheLevel::Llc | CacheLevel::Wt => Self::LLC,
        };
        Self::new().with_valid(true).with_cache(bits).with_address(addr)
    }

    #[must_use]
    pub const fn pde(addr: DmaAddress) -> Self {
        Self::new().with_valid(true).with_address(addr)
    }
}

/// The PTE flavor an address space writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteFormat {
    Snb,
    Ivb,
    Gen8,
    Gen8Global,
}

impl PteFormat {
    #[must_use]
    pub const fn ppgtt(generation: u8) -> Self {
        match generation {
            0..=6 => Self::Snb,
            7 => Self::Ivb,
            _ => Self::Gen8,
        }
    }

    #[must_use]
    pub const fn ggtt(generation: u8) -> Self {
        match Self::ppgtt(generation) {
            Self::Gen8 => Self::Gen8Global,
            other => other,
        }
    }

    /// Only gen8 PPGTT entries carry a meaningful RW bit.
    #[must_use]
    pub const fn supports_read_only(self) -> bool {
        matches!(self, Self::Gen8)
    }

    #[must_use]
    pub const fn encode(self, addr: DmaAddress, cache: CacheLevel, read_only: bool) -> u64 {
        match self {
            Self::Snb => Gen6Entry::snb(addr, cache).into_bits() as u64,
            Self::Ivb => Gen6Entry::ivb(addr, cache).into_bits() as u64,
            Self::Gen8 => Gen8Entry::pte(addr, cache, read_only).into_bits(),
            Self::Gen8Global => Gen8Entry::ggtt_pte(addr).into_bits(),
        }
    }

    /// Target of a valid entry, `None` if the entry is not valid.
    #[must_use]
    pub const fn decode(self, raw: u64) -> Option<DmaAddress> {
        match self {
            Self::Snb | Self::Ivb => {
                #[allow(clippy::cast_possible_truncation)]
                let e = Gen6Entry::from_bits(raw as u32);
                if e.valid() { Some(e.address()) } else { None }
            }
            Self::Gen8 | Self::Gen8Global => {
                let e = Gen8Entry::from_bits(raw);
                if e.present() { Some(e.address()) } else { None }
            }
        }
    }
}

/// Leaf encoding parameters for one insert.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Encoder {
    pub format: PteFormat,
    pub cache: CacheLevel,
    pub read_only: bool,
}

impl Encoder {
    #[inline]
    pub fn encode(&self, dma: u64) -> u64 {
        self.format.encode(DmaAddress::new(dma), self.cache, self.read_only)
    }
}
