//! Smallest-first protocol ID allocator.
//!
//! Free space is a set of `[lo, hi]` ranges; `alloc` peels the smallest
//! integer off the first range, `free` coalesces with a neighbouring range
//! when one exists. Sized at construction to the protocol's ID width —
//! exhaustion means the caller created more live objects than the wire
//! format can address.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{AxonError, Result};

#[derive(Debug)]
struct Inner {
    /// start -> inclusive end of each free range.
    free: BTreeMap<u32, u32>,
    num_alloc: u32,
}

/// Concurrent smallest-first ID allocator.
#[derive(Debug)]
pub struct IdAllocator {
    inner: Mutex<Inner>,
}

impl IdAllocator {
    /// All IDs in `[0, max_id]` start free.
    pub fn new(max_id: u32) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, max_id);
        Self {
            inner: Mutex::new(Inner { free, num_alloc: 0 }),
        }
    }

    /// Allocator sized for an `bits`-wide protocol ID field.
    pub fn for_id_bits(bits: u32) -> Self {
        Self::new((1u32 << bits) - 1)
    }

    /// Take the smallest free ID.
    pub fn alloc(&self) -> Result<u32> {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (&lo, &hi) = g.free.iter().next().ok_or(AxonError::NotSupported)?;
        g.free.remove(&lo);
        if lo < hi {
            g.free.insert(lo + 1, hi);
        }
        g.num_alloc += 1;
        Ok(lo)
    }

    /// Return an ID. The caller must guarantee `id` is currently allocated;
    /// double-free corrupts the range set.
    pub fn free(&self, id: u32) {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        g.num_alloc = g.num_alloc.saturating_sub(1);

        // Absorb the successor range if it starts right after id.
        let end = match id.checked_add(1).and_then(|next| g.free.remove(&next)) {
            Some(succ_end) => succ_end,
            None => id,
        };

        // Extend the predecessor range if it ends right before id.
        let pred = g
            .free
            .range(..id)
            .next_back()
            .map(|(&lo, &hi)| (lo, hi))
            .filter(|&(_, hi)| id > 0 && hi == id - 1);
        if let Some((lo, _)) = pred {
            g.free.insert(lo, end);
        } else {
            g.free.insert(id, end);
        }
    }

    /// Number of currently allocated IDs.
    pub fn allocated(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .num_alloc
    }

    #[cfg(test)]
    fn free_ranges(&self) -> Vec<(u32, u32)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .iter()
            .map(|(&lo, &hi)| (lo, hi))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_smallest_first_and_distinct() {
        let ida = IdAllocator::new(15);
        let mut seen = HashSet::new();
        for expect in 0..=15 {
            let id = ida.alloc().unwrap();
            assert_eq!(id, expect);
            assert!(seen.insert(id));
        }
        assert_eq!(ida.alloc().unwrap_err(), AxonError::NotSupported);
    }

    #[test]
    fn free_reuses_lowest() {
        let ida = IdAllocator::new(100);
        for _ in 0..5 {
            ida.alloc().unwrap();
        }
        ida.free(1);
        ida.free(3);
        assert_eq!(ida.alloc().unwrap(), 1);
        assert_eq!(ida.alloc().unwrap(), 3);
        assert_eq!(ida.alloc().unwrap(), 5);
    }

    #[test]
    fn freeing_everything_restores_one_range() {
        let ida = IdAllocator::new(31);
        let ids: Vec<u32> = (0..=31).map(|_| ida.alloc().unwrap()).collect();
        // Free in a scrambled order to exercise both coalescing arms.
        for id in ids.iter().step_by(2) {
            ida.free(*id);
        }
        for id in ids.iter().skip(1).step_by(2) {
            ida.free(*id);
        }
        assert_eq!(ida.free_ranges(), vec![(0, 31)]);
        assert_eq!(ida.allocated(), 0);
    }

    #[test]
    fn interleaved_alloc_free_stays_in_range() {
        let ida = IdAllocator::new(7);
        let mut live = Vec::new();
        for round in 0..50u32 {
            if round % 3 == 0 && !live.is_empty() {
                ida.free(live.swap_remove(0));
            } else if let Ok(id) = ida.alloc() {
                assert!(id <= 7);
                assert!(!live.contains(&id));
                live.push(id);
            }
        }
    }
}
