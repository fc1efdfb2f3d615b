use super::{GCHandleType, HeapShared};
use crate::value::ObjectRef;
use gc_arena::{Collect, Collection, Finalization, Gc};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashSet},
    sync::atomic::Ordering,
};
use tracing::{debug, trace};

/// Arena root: everything the collector must see besides the mutator's stack.
pub struct HeapManager<'gc> {
    /// Live objects whose type has a finalizer. Not traced: being queued
    /// must not keep an object alive.
    pub finalization_queue: RefCell<Vec<ObjectRef<'gc>>>,
    /// Resurrected objects waiting for their finalizer to run.
    pub pending_finalization: RefCell<Vec<ObjectRef<'gc>>>,
    pub gchandles: RefCell<Vec<Option<(ObjectRef<'gc>, GCHandleType)>>>,
    /// Untraced index of every allocation, keyed by address. Pruned during
    /// finalization so it never outlives the objects it names.
    pub(crate) all_objects: RefCell<BTreeMap<usize, ObjectRef<'gc>>>,
}

impl Default for HeapManager<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'gc> HeapManager<'gc> {
    pub fn new() -> Self {
        Self {
            finalization_queue: RefCell::new(vec![]),
            pending_finalization: RefCell::new(vec![]),
            gchandles: RefCell::new(vec![]),
            all_objects: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn object_count(&self) -> usize {
        self.all_objects.borrow().len()
    }

    pub fn register(&self, obj: ObjectRef<'gc>) {
        self.all_objects.borrow_mut().insert(obj.as_raw(), obj);
        if let Some(handle) = obj.0 {
            if handle.type_handle().has_finalizer() {
                handle.finalizer_registered.set(true);
                self.finalization_queue.borrow_mut().push(obj);
            }
        }
    }

    /// Runs between marking and sweeping. Queues dead finalizable objects
    /// (keeping them and everything they reach alive), clears weak handles to
    /// dead objects, then prunes the object index and ages the survivors.
    pub fn finalize_check(&self, fc: &Finalization<'gc>, shared: &HeapShared, generation: u8) {
        let mut to_finalize = vec![];
        self.finalization_queue.borrow_mut().retain(|obj| {
            let Some(ptr) = obj.0 else {
                return false;
            };
            if ptr.finalizer_suppressed.get() {
                ptr.finalizer_registered.set(false);
                return false;
            }
            if Gc::is_dead(fc, ptr) {
                ptr.finalizer_registered.set(false);
                to_finalize.push(*obj);
                return false;
            }
            true
        });

        // short weak handles: cleared even when the target is about to be resurrected
        for (obj, kind) in self.gchandles.borrow_mut().iter_mut().flatten() {
            if *kind != GCHandleType::Weak {
                continue;
            }
            if let ObjectRef(Some(ptr)) = obj {
                if Gc::is_dead(fc, *ptr) {
                    *obj = ObjectRef::NULL;
                }
            }
        }

        let mut resurrected = HashSet::new();
        if !to_finalize.is_empty() {
            let mut pending = self.pending_finalization.borrow_mut();
            for obj in to_finalize {
                trace!(object = ?obj, "resurrecting for finalization");
                obj.resurrect(fc, &mut resurrected);
                pending.push(obj);
            }
        }

        let max_generation = shared.config().max_generation;
        let mut live_bytes = 0u64;
        let before = self.all_objects.borrow().len();
        self.all_objects.borrow_mut().retain(|addr, obj| {
            let Some(ptr) = obj.0 else {
                return false;
            };
            if Gc::is_dead(fc, ptr) && !resurrected.contains(addr) {
                return false;
            }
            let current = ptr.generation.get();
            if current <= generation && current < max_generation {
                ptr.generation.set(current + 1);
            }
            live_bytes += ptr.size_bytes() as u64;
            true
        });
        let after = self.all_objects.borrow().len();

        shared.metrics().heap_bytes.store(live_bytes, Ordering::Relaxed);
        debug!(
            generation,
            reclaimed = before - after,
            live = after,
            live_bytes,
            resurrected = resurrected.len(),
            "finalization check complete"
        );
    }
}

unsafe impl<'gc> Collect for HeapManager<'gc> {
    fn trace(&self, cc: &Collection) {
        // Normal and Pinned handles keep objects alive, weak handles do not
        for (obj, kind) in self.gchandles.borrow().iter().flatten() {
            match kind {
                GCHandleType::Normal | GCHandleType::Pinned => obj.trace(cc),
                GCHandleType::Weak => {}
            }
        }
        self.pending_finalization.borrow().trace(cc);
    }
}
