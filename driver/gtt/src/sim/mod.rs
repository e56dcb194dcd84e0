//! In-memory stand-ins for the hardware, used by tests and host tooling.
//!
//! * [`HostPages`] hands out heap pages with fake DMA addresses.
//! * [`SimulatedGpu`] models the MMIO registers the GTT touches, a
//!   write-combined GGTT window whose writes stay invisible to the "GPU"
//!   until the flush register is written, and an optional GTT cache.

mod gpu;
mod pages;

pub use gpu::{SimGsm, SimulatedGpu};
pub use pages::{HostPages, HostStats};
