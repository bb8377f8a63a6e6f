//! Opaque handle map.
//!
//! The façade hands applications 64-bit handles instead of pointers. Handles
//! come from a process-local counter, so they stay stable across `fork` —
//! the child clears the tables but never re-issues a parent handle.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maps opaque 64-bit handles to owned objects.
#[derive(Debug)]
pub struct HandleMap<T> {
    map: Mutex<BTreeMap<u64, Arc<T>>>,
    next: AtomicU64,
}

impl<T> HandleMap<T> {
    /// An empty map.
    pub const fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Register `obj` and return its handle.
    pub fn insert(&self, obj: Arc<T>) -> u64 {
        let hdl = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.lock().insert(hdl, obj);
        hdl
    }

    /// Look up a handle.
    pub fn get(&self, hdl: u64) -> Option<Arc<T>> {
        self.map.lock().get(&hdl).cloned()
    }

    /// Drop a handle, returning the object if it was present.
    pub fn remove(&self, hdl: u64) -> Option<Arc<T>> {
        self.map.lock().remove(&hdl)
    }

    /// Remove and return an arbitrary entry. Used by teardown loops.
    pub fn take_any(&self) -> Option<(u64, Arc<T>)> {
        let mut g = self.map.lock();
        let hdl = *g.keys().next()?;
        let obj = g.remove(&hdl)?;
        Some((hdl, obj))
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.map.lock().clear();
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// True when no handles are live.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Lock the table and leak the guard. Fork pre-handler only.
    pub fn lock_for_fork(&self) {
        std::mem::forget(self.map.lock());
    }

    /// Release a lock taken by [`HandleMap::lock_for_fork`].
    ///
    /// # Safety
    ///
    /// Must pair with exactly one `lock_for_fork` on this map, in the fork
    /// parent or child handler.
    pub unsafe fn unlock_after_fork(&self) {
        self.map.force_unlock();
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_stable_and_unique() {
        let map = HandleMap::new();
        let a = map.insert(Arc::new(1u32));
        let b = map.insert(Arc::new(2u32));
        assert_ne!(a, b);
        assert_eq!(*map.get(a).unwrap(), 1);
        assert_eq!(*map.get(b).unwrap(), 2);
        // A removed handle is never re-issued.
        map.remove(a);
        let c = map.insert(Arc::new(3u32));
        assert_ne!(c, a);
        assert!(map.get(a).is_none());
    }

    #[test]
    fn take_any_drains() {
        let map = HandleMap::new();
        for i in 0..4u32 {
            map.insert(Arc::new(i));
        }
        let mut n = 0;
        while map.take_any().is_some() {
            n += 1;
        }
        assert_eq!(n, 4);
        assert!(map.is_empty());
    }
}
