//! Synchronization primitives for the cache service.
//!
//! `RefCounter` is the reference-counted mutex the region lifecycle is
//! built on: shared mode means "outstanding work", exclusive mode means
//! "wait for all outstanding work to finish". `Latch` is the one-shot
//! loading event fetch callers block on. Both are a count/flag plus a
//! condvar, nothing more.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct RefState {
    shared: usize,
    exclusive: bool,
}

/// Shared count with exclusive drain.
pub(crate) struct RefCounter {
    state: Mutex<RefState>,
    cond: Condvar,
}

impl RefCounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefState::default()),
            cond: Condvar::new(),
        }
    }

    /// Increment the outstanding-work count; blocks only while an
    /// exclusive holder drains.
    pub fn acquire_shared(&self) {
        let mut st = self.state.lock();
        while st.exclusive {
            self.cond.wait(&mut st);
        }
        st.shared += 1;
    }

    /// Decrement; wakes exclusive waiters on zero.
    pub fn release_shared(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.shared > 0);
        st.shared = st.shared.saturating_sub(1);
        if st.shared == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait for all outstanding work to drain, then hold exclusively.
    pub fn lock_exclusive(&self) {
        let mut st = self.state.lock();
        while st.exclusive || st.shared > 0 {
            self.cond.wait(&mut st);
        }
        st.exclusive = true;
    }

    /// Hold exclusively iff nothing is outstanding.
    pub fn try_lock_exclusive(&self) -> bool {
        let mut st = self.state.lock();
        if st.exclusive || st.shared > 0 {
            return false;
        }
        st.exclusive = true;
        true
    }

    pub fn unlock_exclusive(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.exclusive);
        st.exclusive = false;
        self.cond.notify_all();
    }

    /// Drop every reference. Only valid when the holders are known to be
    /// gone (the child side of fork).
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.shared = 0;
        st.exclusive = false;
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn try_acquire_shared(&self) -> bool {
        let mut st = self.state.lock();
        if st.exclusive {
            return false;
        }
        st.shared += 1;
        true
    }
}

/// One-shot event: transitions once from "loading" to "ready" and wakes
/// every waiter.
pub(crate) struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

/// Worker wake-up event.
pub(crate) struct WorkEvent {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkEvent {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }

    /// Block until notified; consumes the notification.
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.cond.wait(&mut pending);
        }
        *pending = false;
    }

    /// Hold the event mutex across fork. Paired with [`Self::force_unlock`].
    pub fn lock_for_fork(&self) {
        std::mem::forget(self.pending.lock());
    }

    /// Release a hold taken by [`Self::lock_for_fork`].
    ///
    /// # Safety
    ///
    /// The caller must currently hold the mutex via `lock_for_fork` on this
    /// thread (or own it exclusively in a forked child).
    pub unsafe fn force_unlock(&self) {
        // SAFETY: contract forwarded to the caller.
        unsafe { self.pending.force_unlock() };
    }
}

/// Per-translator-thread accounting handle.
///
/// Every submitted translation rides with a clone of the submitting
/// thread's token; the shared count equals that thread's in-flight
/// submissions. The fork/exec hooks drain a thread's token before
/// quiescing the service.
#[derive(Clone)]
pub struct ThreadToken {
    counter: Arc<RefCounter>,
}

impl ThreadToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: Arc::new(RefCounter::new()),
        }
    }

    pub(crate) fn begin(&self) {
        self.counter.acquire_shared();
    }

    pub(crate) fn end(&self) {
        self.counter.release_shared();
    }

    pub(crate) fn lock_exclusive(&self) {
        self.counter.lock_exclusive();
    }

    pub(crate) fn unlock_exclusive(&self) {
        self.counter.unlock_exclusive();
    }

    /// Wait for every in-flight submission from this thread to finish.
    pub fn wait_idle(&self) {
        self.counter.lock_exclusive();
        self.counter.unlock_exclusive();
    }
}

impl Default for ThreadToken {
    fn default() -> Self {
        Self::new()
    }
}
