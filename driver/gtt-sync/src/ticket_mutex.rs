use crate::backoff::Backoff;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// FIFO ticket lock guarding one address space.
///
/// Waiters are served in arrival order, so a bind storm from one context
/// cannot starve an unbind from another. Unlike [`SpinLock`](crate::SpinLock)
/// holding it is not atomic context: holders allocate table pages, which may
/// block, and waiters back off to the scheduler instead of spinning.
pub struct TicketMutex<T> {
    next: AtomicUsize,
    serving: AtomicUsize,
    value: UnsafeCell<T>,
}

// Safety: the ticket protocol admits one holder at a time.
unsafe impl<T: Send> Sync for TicketMutex<T> {}
unsafe impl<T: Send> Send for TicketMutex<T> {}

impl<T: Default> Default for TicketMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Exclusive access through `&mut self`; no locking required.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Takes a ticket and waits for it to be served.
    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        while self.serving.load(Ordering::Acquire) != ticket {
            backoff.snooze();
        }
        TicketMutexGuard { lock: self }
    }

    /// Single attempt. Reclaim paths use this to skip contended spaces.
    pub fn try_lock(&self) -> Option<TicketMutexGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| TicketMutexGuard { lock: self })
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Racy snapshot; only meaningful for assertions and diagnostics.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }

    /// Tickets handed out but not yet served, the holder included.
    #[inline]
    #[must_use]
    pub fn queued(&self) -> usize {
        self.next
            .load(Ordering::Relaxed)
            .wrapping_sub(self.serving.load(Ordering::Relaxed))
    }
}

pub struct TicketMutexGuard<'a, T> {
    lock: &'a TicketMutex<T>,
}

impl<T> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TicketMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TicketMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Only the holder advances `serving`.
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}
