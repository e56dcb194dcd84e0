//! Cooperative "stop the machine" barrier.
//!
//! Some GPUs corrupt GGTT updates that race with CPU traffic through the
//! aperture. The fix is heavy-handed: every other agent that may touch the
//! aperture parks at a checkpoint while a single closure performs the update.
//!
//! ```text
//!  stopper                      participant A          participant B
//!  ───────                      ─────────────          ─────────────
//!  stop = true
//!  wait parked == registered ─► checkpoint(): park     checkpoint(): park
//!  run f()
//!  stop = false              ─► resume                 resume
//!  wait parked == 0
//! ```
//!
//! Participants must only call [`Participant::checkpoint`] while holding no
//! lock the closure needs, or the stopper spins forever.

use crate::backoff::Backoff;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Rendezvous {
    registered: AtomicUsize,
    parked: AtomicUsize,
    stop: AtomicBool,
    stopper: AtomicBool,
    generation: AtomicUsize,
}

impl Rendezvous {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registered: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            stopper: AtomicBool::new(false),
            generation: AtomicUsize::new(0),
        }
    }

    /// Enrolls the calling context. Every registered participant must reach a
    /// checkpoint before a stopper can proceed.
    pub fn register(&self) -> Participant<'_> {
        self.registered.fetch_add(1, Ordering::AcqRel);
        Participant { rendezvous: self }
    }

    /// Number of completed stop cycles.
    #[must_use]
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn participants(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    /// Runs `f` while every registered participant is parked.
    ///
    /// Must not be called by a registered participant; use
    /// [`Participant::stop_machine`] instead.
    pub fn stop_machine<R>(&self, f: impl FnOnce() -> R) -> R {
        self.run_stopped(0, f)
    }

    fn run_stopped<R>(&self, self_parked: usize, f: impl FnOnce() -> R) -> R {
        let mut backoff = Backoff::new();
        while self
            .stopper
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // A participant waiting its turn still counts toward the other stop.
            if self_parked != 0 {
                self.park();
            }
            backoff.snooze();
        }

        self.parked.fetch_add(self_parked, Ordering::AcqRel);
        self.stop.store(true, Ordering::SeqCst);
        let mut backoff = Backoff::new();
        while self.parked.load(Ordering::Acquire) < self.registered.load(Ordering::Acquire) {
            backoff.snooze();
        }

        let result = f();

        self.stop.store(false, Ordering::SeqCst);
        self.parked.fetch_sub(self_parked, Ordering::AcqRel);
        let mut backoff = Backoff::new();
        while self.parked.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.stopper.store(false, Ordering::Release);
        result
    }

    #[inline]
    fn park(&self) {
        if !self.stop.load(Ordering::Acquire) {
            return;
        }
        self.parked.fetch_add(1, Ordering::AcqRel);
        let mut backoff = Backoff::new();
        while self.stop.load(Ordering::Acquire) {
            backoff.snooze();
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A registered execution context. Dropping it deregisters.
#[derive(Debug)]
pub struct Participant<'a> {
    rendezvous: &'a Rendezvous,
}

impl Participant<'_> {
    /// Parks while a stop is in progress; otherwise returns immediately.
    #[inline]
    pub fn checkpoint(&self) {
        self.rendezvous.park();
    }

    /// Like [`Rendezvous::stop_machine`], counting the caller as parked.
    pub fn stop_machine<R>(&self, f: impl FnOnce() -> R) -> R {
        self.rendezvous.run_stopped(1, f)
    }
}

impl Drop for Participant<'_> {
    fn drop(&mut self) {
        self.rendezvous.registered.fetch_sub(1, Ordering::AcqRel);
    }
}
