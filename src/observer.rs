//! A generation+index slab for observer storage, shared by [`crate::token`]
//! and [`crate::future`]. Implements the "indirection table keyed by
//! generation+index" alternative to weak closures that spec.md §9 calls out
//! for languages without first-class weak references; here it's used even
//! though Rust has `Weak`, because it gives O(1) removal by handle without
//! needing the handler itself to be `Arc`-wrapped.

/// A stable reference to a single registered observer, used to remove it
/// again before it fires (e.g. when an `unless` token cancels first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ObserverHandle {
    index: usize,
    generation: u64,
}

struct Slot<H> {
    seq: u64,
    generation: u64,
    handler: H,
}

/// Observers fire in registration order (spec.md §5). Slot indices get
/// reused via the free list, so order is tracked independently via a
/// monotonic sequence number rather than index order.
pub(crate) struct ObserverList<H> {
    slots: Vec<Option<Slot<H>>>,
    free: Vec<usize>,
    next_seq: u64,
    next_generation: u64,
}

impl<H> ObserverList<H> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
            next_generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, handler: H) -> ObserverHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = Slot {
            seq,
            generation,
            handler,
        };

        let index = if let Some(index) = self.free.pop() {
            self.slots[index] = Some(slot);
            index
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };

        ObserverHandle { index, generation }
    }

    /// Removes the observer referenced by `handle`, if it is still present
    /// (it may already have fired, or have been removed by something else).
    pub(crate) fn remove(&mut self, handle: ObserverHandle) -> Option<H> {
        let slot_opt = self.slots.get_mut(handle.index)?;
        let matches_generation = matches!(slot_opt, Some(slot) if slot.generation == handle.generation);
        if !matches_generation {
            return None;
        }

        let slot = slot_opt.take()?;
        self.free.push(handle.index);
        Some(slot.handler)
    }

    /// Removes every registered observer and returns them in registration
    /// order, leaving the list empty. This is how both token cancellation
    /// and future completion fan out to observers: drain first, then run
    /// handlers outside of any lock.
    pub(crate) fn drain_in_order(&mut self) -> Vec<H> {
        let mut items: Vec<Slot<H>> = self.slots.iter_mut().filter_map(|slot| slot.take()).collect();
        self.free.clear();
        items.sort_by_key(|slot| slot.seq);
        items.into_iter().map(|slot| slot.handler).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
