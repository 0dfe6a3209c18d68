// SPDX-License-Identifier: CEPL-1.0
//! Index allocation for the bindless sampled-image array.
//!
//! Indices are handed out from a LIFO free list, falling back to a monotonic
//! high-water mark. Every issued index is tracked in a lease registry so a
//! double free is caught immediately and leaks are reported at shutdown.
//!
//! Resources normally hold a [`BindlessSlot`], a shared lease whose last
//! clone returns the index when dropped. The allocator must outlive every
//! slot issued from it, which the `Arc` inside each lease guarantees.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RenderError;

#[derive(Debug, Default)]
struct SlotState {
    next_index: u32,
    free_indices: Vec<u32>,
    leased: BTreeSet<u32>,
}

#[derive(Default)]
pub struct BindlessSlotAllocator {
    state: Mutex<SlotState>,
}

impl BindlessSlotAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the most recently freed index, or a fresh one.
    pub fn push(&self) -> u32 {
        let mut state = self.state();
        let index = match state.free_indices.pop() {
            Some(index) => index,
            None => {
                let index = state.next_index;
                state.next_index += 1;
                index
            }
        };
        state.leased.insert(index);
        index
    }

    /// Returns `index` to the free list.
    ///
    /// # Panics
    /// If `index` is not currently leased from this allocator.
    pub fn free(&self, index: u32) {
        let mut state = self.state();
        assert!(
            state.leased.remove(&index),
            "bindless slot {index} freed but not leased (double free or foreign index)"
        );
        state.free_indices.push(index);
    }

    /// Allocates an index wrapped in a lease that frees it on last drop.
    pub fn lease(self: &Arc<Self>) -> BindlessSlot {
        let index = self.push();
        tracing::trace!(index, "bindless slot leased");
        BindlessSlot(Arc::new(SlotLease {
            index,
            allocator: Arc::clone(self),
        }))
    }

    /// Indices that are currently leased, in ascending order.
    pub fn outstanding(&self) -> Vec<u32> {
        self.state().leased.iter().copied().collect()
    }

    /// High-water mark: how many distinct indices were ever issued.
    pub fn issued(&self) -> u32 {
        self.state().next_index
    }

    /// Checks that every issued index came back.
    pub fn shutdown(&self) -> Result<(), RenderError> {
        let state = self.state();
        if state.leased.is_empty() {
            debug_assert_eq!(state.free_indices.len(), state.next_index as usize);
            return Ok(());
        }
        Err(RenderError::LeakedBindlessSlots(
            state.leased.iter().copied().collect(),
        ))
    }
}

impl fmt::Debug for BindlessSlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("BindlessSlotAllocator")
            .field("next_index", &state.next_index)
            .field("free", &state.free_indices.len())
            .field("leased", &state.leased.len())
            .finish()
    }
}

struct SlotLease {
    index: u32,
    allocator: Arc<BindlessSlotAllocator>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        tracing::trace!(index = self.index, "bindless slot released");
        self.allocator.free(self.index);
    }
}

/// Shared handle to one leased index. Clones share the lease.
#[derive(Clone)]
pub struct BindlessSlot(Arc<SlotLease>);

impl BindlessSlot {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0.index
    }
}

impl fmt::Debug for BindlessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BindlessSlot").field(&self.0.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_most_recently_freed_index() {
        let allocator = BindlessSlotAllocator::new();
        assert_eq!(allocator.push(), 0);
        assert_eq!(allocator.push(), 1);
        allocator.free(0);
        assert_eq!(allocator.push(), 0);
        assert_eq!(allocator.push(), 2);
    }

    #[test]
    fn refills_in_reverse_free_order() {
        let allocator = BindlessSlotAllocator::new();
        let indices: Vec<u32> = (0..4).map(|_| allocator.push()).collect();
        assert_eq!(indices, [0, 1, 2, 3]);

        for &index in &[2, 0, 3, 1] {
            allocator.free(index);
        }
        let again: Vec<u32> = (0..4).map(|_| allocator.push()).collect();
        assert_eq!(again, [1, 3, 0, 2]);
        assert_eq!(allocator.issued(), 4);
    }

    #[test]
    fn no_index_is_held_twice() {
        let allocator = BindlessSlotAllocator::new();
        let mut held = BTreeSet::new();
        for step in 0..64u32 {
            if step % 3 == 2 {
                let victim = *held.iter().next().unwrap();
                held.remove(&victim);
                allocator.free(victim);
            } else {
                assert!(held.insert(allocator.push()));
            }
        }
        assert_eq!(allocator.outstanding(), held.into_iter().collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let allocator = BindlessSlotAllocator::new();
        let index = allocator.push();
        allocator.free(index);
        allocator.free(index);
    }

    #[test]
    fn last_lease_drop_returns_slot() {
        let allocator = BindlessSlotAllocator::new();
        let slot = allocator.lease();
        let shared = slot.clone();
        assert_eq!(slot.index(), 0);

        drop(slot);
        assert_eq!(allocator.outstanding(), [0]);

        drop(shared);
        assert!(allocator.outstanding().is_empty());
        assert_eq!(allocator.lease().index(), 0);
    }

    #[test]
    fn shutdown_reports_leaked_slots() {
        let allocator = BindlessSlotAllocator::new();
        let _kept = allocator.lease();
        let dropped = allocator.lease();
        drop(dropped);

        match allocator.shutdown() {
            Err(RenderError::LeakedBindlessSlots(leaked)) => assert_eq!(leaked, [0]),
            other => panic!("unexpected shutdown result: {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_clean_once_everything_returned() {
        let allocator = BindlessSlotAllocator::new();
        let slots: Vec<_> = (0..3).map(|_| allocator.lease()).collect();
        drop(slots);
        assert!(allocator.shutdown().is_ok());
    }
}
