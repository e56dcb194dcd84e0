//! Per-thread spin-lock nesting, the equivalent of a preempt count.
//!
//! Page release may block (attribute conversion), so it must never run while
//! a [`SpinLock`](crate::SpinLock) is held. With the `std` feature the depth
//! is tracked in a thread local and [`might_sleep`] asserts on it; without it
//! every check is a no-op.

#[cfg(feature = "std")]
mod imp {
    use std::cell::Cell;

    std::thread_local! {
        static DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    #[inline]
    pub fn enter() {
        DEPTH.with(|d| d.set(d.get() + 1));
    }

    #[inline]
    pub fn exit() {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }

    #[inline]
    pub fn depth() -> usize {
        DEPTH.with(Cell::get)
    }
}

#[cfg(not(feature = "std"))]
mod imp {
    #[inline]
    pub const fn enter() {}

    #[inline]
    pub const fn exit() {}

    #[inline]
    pub const fn depth() -> usize {
        0
    }
}

pub(crate) use imp::{enter, exit};

/// `true` while the current thread holds at least one spin lock.
#[inline]
#[must_use]
pub fn in_atomic() -> bool {
    imp::depth() != 0
}

/// Annotates a call that may block.
///
/// # Panics
/// In debug builds with the `std` feature, if a spin lock is held.
#[inline]
#[track_caller]
pub fn might_sleep() {
    debug_assert!(!in_atomic(), "blocking call from atomic context");
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::SpinLock;

    #[test]
    fn depth_follows_guards() {
        let a = SpinLock::new(());
        let b = SpinLock::new(());
        assert!(!in_atomic());
        {
            let _ga = a.lock();
            let _gb = b.lock();
            assert!(in_atomic());
        }
        assert!(!in_atomic());
        might_sleep();
    }
}
