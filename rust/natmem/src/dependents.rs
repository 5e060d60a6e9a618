//! Bookkeeping that connects a heap registry to the buffers allocated from it.
//!
//! The registry never holds a buffer. Each buffer publishes its allocation
//! descriptor into a shared [`Link`], and the registry keeps the links in a
//! generation-checked [`DependentArena`]. On close, the registry tears down
//! the memory each link describes and leaves the outcome in the link; the
//! buffer picks it up the next time it is touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::options::{Teardown, TeardownOutcome};
use crate::store::Store;

/// Allocation descriptor shared between a buffer and its registry.
pub(crate) struct Link {
    pending: AtomicBool,
    state: Mutex<LinkState>,
}

pub(crate) struct LinkState {
    pub ptr: *mut u8,
    pub len: usize,
    pub store: Store,
    pub teardown: Teardown,
    pub owns_memory: bool,
    /// Set by the buffer once it stops caring about teardown (it was dropped
    /// or released its memory to the caller).
    pub detached: bool,
    pub outcome: Option<TeardownOutcome>,
}

// The pointer in `LinkState` is only dereferenced under the link mutex, by
// whichever side currently owns the allocation.
unsafe impl Send for LinkState {}

impl Link {
    pub fn new(store: Store, teardown: Teardown) -> Arc<Link> {
        Arc::new(Link {
            pending: AtomicBool::new(false),
            state: Mutex::new(LinkState {
                ptr: std::ptr::null_mut(),
                len: 0,
                store,
                teardown,
                owns_memory: true,
                detached: false,
                outcome: None,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` once the registry has recorded a teardown outcome.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn set_outcome(&self, state: &mut LinkState, outcome: TeardownOutcome) {
        state.outcome = Some(outcome);
        self.pending.store(true, Ordering::Release);
    }
}

/// Key returned when a link is registered.
///
/// The generation makes a key stale once its slot has been reused or cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DependentKey {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    link: Option<Arc<Link>>,
}

#[derive(Default)]
pub(crate) struct DependentArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl DependentArena {
    pub fn insert(&mut self, link: Arc<Link>) -> DependentKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.link = Some(link);
            return DependentKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            link: Some(link),
        });
        DependentKey {
            index,
            generation: 0,
        }
    }

    /// Unregisters `key`. Stale keys are ignored and return `false`.
    pub fn remove(&mut self, key: DependentKey) -> bool {
        let Some(slot) = self.slots.get_mut(key.index as usize) else {
            return false;
        };
        if slot.generation != key.generation || slot.link.is_none() {
            return false;
        }
        slot.link = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        true
    }

    /// Empties the arena, returning every registered link. All outstanding
    /// keys become stale.
    pub fn drain(&mut self) -> Vec<Arc<Link>> {
        let mut links = Vec::with_capacity(self.live);
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(link) = slot.link.take() {
                links.push(link);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
        self.live = 0;
        links
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BufferOptions;

    fn link() -> Arc<Link> {
        let store = Store::new(&BufferOptions::com_task(), natmem_sys::heap::process_heap());
        Link::new(store, Teardown::Cascade)
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = DependentArena::default();
        let a = arena.insert(link());
        let b = arena.insert(link());
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(a));
        assert!(!arena.remove(a), "double removal");
        let c = arena.insert(link());
        assert_ne!(a, c, "reused slot must carry a new generation");
        assert!(!arena.remove(a), "stale key");
        assert!(arena.remove(b));
        assert!(arena.remove(c));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_drain_invalidates_keys() {
        let mut arena = DependentArena::default();
        let keys: Vec<_> = (0..10).map(|_| arena.insert(link())).collect();
        arena.remove(keys[3]);
        let links = arena.drain();
        assert_eq!(links.len(), 9);
        assert_eq!(arena.len(), 0);
        assert!(keys.iter().all(|&k| !arena.remove(k)));

        let fresh = arena.insert(link());
        assert!(arena.remove(fresh));
    }

    #[test]
    fn test_link_outcome() {
        let link = link();
        assert!(!link.is_pending());
        {
            let mut state = link.lock();
            link.set_outcome(&mut state, TeardownOutcome::Released);
        }
        assert!(link.is_pending());
        assert_eq!(link.lock().outcome, Some(TeardownOutcome::Released));
    }
}
