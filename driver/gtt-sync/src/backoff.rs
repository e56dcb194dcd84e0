//! Wait strategy for contended locks.
//!
//! Waiters spin briefly, then give their time slice away. On a machine with
//! fewer CPUs than waiters, a FIFO lock whose next owner is descheduled would
//! otherwise burn whole slices on every handoff.

use core::hint::spin_loop;

/// Busy-wait rounds before a waiter starts yielding.
pub const SPIN_LIMIT: u32 = 64;

#[derive(Debug, Default)]
pub struct Backoff {
    rounds: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { rounds: 0 }
    }

    /// One wait step: a pause hint while under [`SPIN_LIMIT`], a yield after.
    #[inline]
    pub fn snooze(&mut self) {
        if self.rounds < SPIN_LIMIT {
            self.rounds += 1;
            spin_loop();
        } else {
            relax();
        }
    }

    /// `true` once the waiter has stopped busy-waiting.
    #[inline]
    #[must_use]
    pub const fn is_yielding(&self) -> bool {
        self.rounds >= SPIN_LIMIT
    }
}

#[cfg(feature = "std")]
#[inline]
fn relax() {
    std::thread::yield_now();
}

#[cfg(not(feature = "std"))]
#[inline]
fn relax() {
    spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_after_the_spin_budget() {
        let mut b = Backoff::new();
        for _ in 0..SPIN_LIMIT - 1 {
            b.snooze();
        }
        assert!(!b.is_yielding());
        b.snooze();
        assert!(b.is_yielding());
        b.snooze();
        assert!(b.is_yielding());
    }
}
