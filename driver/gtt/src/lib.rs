//! # GPU Translation Tables
//!
//! Builds and tears down the page tables through which a GPU reaches host
//! memory: the single global GTT (GGTT) and per-context PPGTTs of two, three
//! or four levels.
//!
//! ## What you get
//! - A [`Device`] holding the shared page pool and the stop-machine barrier.
//! - [`AddressSpace`]s that reserve GPU virtual ranges, populate page-table
//!   nodes lazily and free them again the moment they fall empty.
//! - A [`Ggtt`] that flushes and invalidates after every update, with an
//!   optional aliasing PPGTT for `LOCAL_BIND` users.
//! - Scratch chains: every unused entry at every level points at a valid
//!   scratch structure, never at zero.
//! - 2 MiB and 64 KiB leaves on four-level spaces when the device and the
//!   backing pages allow them.
//! - Page-table pages recycled through per-space stashes and a per-device
//!   write-combined pool.
//! - A consistency checker ([`AddressSpace::verify`]) and a table dump.
//!
//! ## Gen8 Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDP  |  PD   |  PT   | Offset |
//! ```
//!
//! Three-level spaces stop at the PDP (4 entries, 4 GiB). Gen6/7 spaces use a
//! 512-entry directory of 1024-entry tables with 32-bit entries:
//!
//! ```text
//! | 30‒22 | 21‒12 | 11‒0   |
//! |  PDE  |  PTE  | Offset |
//! ```
//!
//! ## Ownership
//!
//! Every table page is a [`TablePage`] that knows the allocator it came from.
//! Dropping a node returns its page, so freeing a subtree is a plain drop and
//! an error halfway through an allocation unwinds without leaking.
//!
//! ```rust
//! # use gtt::*;
//! # use gtt::sim::HostPages;
//! # use std::sync::Arc;
//! let backend = Arc::new(HostPages::new());
//! let device = Device::new(info::platforms::SKYLAKE, info::GttConfig::new(), backend);
//! let ppgtt = device.create_ppgtt().unwrap();
//!
//! let pages = Arc::new(SgTable::contiguous(DmaAddress::new(0x1_0000_0000), 0x4000).unwrap());
//! let node = ppgtt.bind(&BindRequest::new(pages)).unwrap();
//! assert!(ppgtt.read_pte(node.start()).is_some());
//! assert!(ppgtt.verify().is_empty());
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod device;
mod entry;
mod error;
mod fault;
mod ggtt;
mod gsm;
mod node;
mod page;
mod pool;
mod range;
mod scratch;
mod sg;
mod space;
mod walk;

pub mod sim;

pub use device::Device;
pub use entry::{Gen6Entry, Gen8Entry, PteFormat};
pub use error::GttError;
pub use fault::{DeviceFault, check_faults};
pub use ggtt::Ggtt;
pub use gsm::{GsmWindow, LocalGsm};
pub use page::{DmaPage, PAGE_SIZE, PageBackend, TablePage};
pub use pool::{PageAllocator, Reclaim, WcPool};
pub use range::RangeAllocator;
pub use sg::{SgChunk, SgTable};
pub use space::{AddressSpace, BindRequest, Binding, Evictor, Placement, SpaceStats};
pub use walk::{Inconsistency, Level, NodeCount, TableFormat};

pub use gtt_addresses::{DmaAddress, GttAddress, GttRange, PageSize, Size2M, Size4K, Size64K};
pub use gtt_info as info;

/// Caching attribute requested for a mapping.
///
/// How each level is encoded depends on the entry format; gen6 folds `Wt`
/// into LLC and gen8 has no separate L3 control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    None,
    Llc,
    L3Llc,
    Wt,
}

bitflags::bitflags! {
    /// Per-binding flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        /// Map without write permission. Only gen8 PPGTT entries can express it.
        const READ_ONLY = 1 << 0;
        /// GGTT binding that must also be visible through the aliasing PPGTT.
        const LOCAL_BIND = 1 << 1;
        /// GGTT binding visible through the global table.
        const GLOBAL_BIND = 1 << 2;
    }
}
