//! Condition-variable wait primitive.
//!
//! Bundles a mutex-protected state value with a condvar. Every blocking wait
//! in the library goes through here: predicates combine the caller's own
//! condition with the relevant break condition (context broken, ring
//! invalidated), and cancellation is purely predicate-driven.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::NO_TIMEOUT;

/// A mutex-guarded state value with broadcast wakeups.
#[derive(Debug, Default)]
pub struct WaitQueue<T> {
    state: Mutex<T>,
    cv: Condvar,
}

impl<T> WaitQueue<T> {
    /// Wrap an initial state.
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cv: Condvar::new(),
        }
    }

    /// Lock the state without waiting.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock without blocking; `None` when the lock is held. Fork-child
    /// paths use this because a parent thread may have died mid-critical-
    /// section.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Run `f` under the lock, then broadcast.
    pub fn update_and_notify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        let ret = f(&mut guard);
        drop(guard);
        self.cv.notify_all();
        ret
    }

    /// Broadcast without touching the state.
    pub fn notify_all(&self) {
        self.cv.notify_all();
    }

    /// Wait until `pred` holds, keeping the lock so the caller can inspect
    /// state before releasing it.
    pub fn wait_lock(&self, mut pred: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        let mut guard = self.lock();
        while !pred(&mut guard) {
            guard = self
                .cv
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        guard
    }

    /// Wait until `pred` holds or `timeout_us` elapses. [`NO_TIMEOUT`] waits
    /// forever. Returns the guard when the predicate became true, `None` on
    /// timeout.
    pub fn wait_timeout_lock(
        &self,
        timeout_us: u32,
        mut pred: impl FnMut(&mut T) -> bool,
    ) -> Option<MutexGuard<'_, T>> {
        if timeout_us == NO_TIMEOUT {
            return Some(self.wait_lock(pred));
        }
        let guard = self.lock();
        let (guard, result) = self
            .cv
            .wait_timeout_while(guard, Duration::from_micros(u64::from(timeout_us)), |s| {
                !pred(s)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            None
        } else {
            Some(guard)
        }
    }

    /// Wait until `pred` holds, releasing the lock before returning.
    pub fn wait(&self, pred: impl FnMut(&mut T) -> bool) {
        drop(self.wait_lock(pred));
    }

    /// Like [`WaitQueue::wait`] with a timeout; `true` when the predicate
    /// became true.
    pub fn wait_timeout(&self, timeout_us: u32, pred: impl FnMut(&mut T) -> bool) -> bool {
        self.wait_timeout_lock(timeout_us, pred).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn timeout_elapses_when_predicate_never_holds() {
        let wq = WaitQueue::new(0u32);
        let start = Instant::now();
        assert!(!wq.wait_timeout(20_000, |v| *v != 0));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn update_wakes_waiter() {
        let wq = Arc::new(WaitQueue::new(false));
        let w2 = Arc::clone(&wq);
        let t = thread::spawn(move || {
            w2.wait(|done| *done);
        });
        thread::sleep(Duration::from_millis(10));
        wq.update_and_notify(|done| *done = true);
        t.join().unwrap();
    }

    #[test]
    fn wait_lock_keeps_state_consistent() {
        let wq = Arc::new(WaitQueue::new(0u32));
        let w2 = Arc::clone(&wq);
        let t = thread::spawn(move || {
            let guard = w2.wait_lock(|v| *v >= 3);
            *guard
        });
        for _ in 0..3 {
            wq.update_and_notify(|v| *v += 1);
        }
        assert_eq!(t.join().unwrap(), 3);
    }
}
