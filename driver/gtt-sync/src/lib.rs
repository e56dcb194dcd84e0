//! # GTT synchronization primitives
//!
//! * [`SpinLock`] guards short O(1) critical sections such as page stashes.
//!   Holding one puts the thread in *atomic context*: see [`might_sleep`].
//! * [`TicketMutex`] is the fair, space-wide lock serializing structural
//!   changes to one address space. Its waiters spin for a bounded number of
//!   rounds and then yield (with the `std` feature), see [`Backoff`].
//! * [`Rendezvous`] pauses every registered participant while one closure
//!   runs, for hardware that cannot tolerate concurrent aperture traffic
//!   during GGTT updates.

#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![allow(unsafe_code)]

mod atomic_context;
mod backoff;
mod rendezvous;
mod spin_lock;
mod ticket_mutex;

pub use atomic_context::{in_atomic, might_sleep};
pub use backoff::{Backoff, SPIN_LIMIT};
pub use rendezvous::{Participant, Rendezvous};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use ticket_mutex::{TicketMutex, TicketMutexGuard};
