//! Garbage collection bridge for the object model.
//!
//! This module contains all GC-related functionality:
//! - The arena that owns every managed object ([`ManagedHeap`])
//! - The per-mutation allocation and collection surface ([`GcBridge`], [`GcContext`])
//! - Finalization, GC handles and unmanaged memory-pressure accounting
//!
//! Collections never run inside a mutation. Requests made while mutating
//! (explicit `collect` calls or the pressure controller) are recorded and
//! serviced as soon as the mutation returns.
pub mod heap;
pub mod pressure;

pub use heap::HeapManager;
pub use pressure::{MemoryPressure, PressureSnapshot};

use crate::{
    config::RuntimeConfig,
    error::{RuntimeError, RuntimeResult},
    types::{core_types, TypeCatalog, TypeHandle},
    utils::ByteOffset,
    value::{layout::ArrayLayoutManager, storage::FieldStorage, ObjectInner, ObjectRef, HEADER_SIZE},
    vm::metrics::RuntimeMetrics,
};
use bitflags::bitflags;
use gc_arena::{Arena, Mutation, Rootable};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, trace};

pub type GCHandle<'gc> = &'gc Mutation<'gc>;

type HeapArena = Arena<Rootable!['gc => HeapManager<'gc>]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CollectionMode {
    Default = 0,
    Forced = 1,
    /// Lets the collector skip the collection when it would reclaim little.
    Optimized = 2,
}

impl CollectionMode {
    pub fn from_raw(mode: i32) -> RuntimeResult<Self> {
        match mode {
            0 => Ok(Self::Default),
            1 => Ok(Self::Forced),
            2 => Ok(Self::Optimized),
            _ => Err(RuntimeError::out_of_range("mode", "Enum value was out of legal range.")),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CollectionFlags: u8 {
        const NON_BLOCKING = 1;
        const BLOCKING = 2;
        const OPTIMIZED = 4;
        const COMPACTING = 8;
    }
}

impl From<CollectionMode> for CollectionFlags {
    fn from(mode: CollectionMode) -> Self {
        match mode {
            CollectionMode::Default | CollectionMode::Forced => CollectionFlags::BLOCKING,
            CollectionMode::Optimized => CollectionFlags::NON_BLOCKING | CollectionFlags::OPTIMIZED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GCHandleType {
    Weak,
    Normal,
    Pinned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcHandleId(pub usize);

/// What the pressure controller needs to know about the collector.
pub trait GcStatus {
    fn collection_count(&self, generation: u8) -> u32;
    fn current_object_size(&self) -> u64;
    /// Time since the heap was created.
    fn now(&self) -> Duration;
    fn last_gc_start(&self, generation: u8) -> Duration;
    fn last_gc_duration(&self, generation: u8) -> Duration;
    fn request_collection(&self, generation: u8, flags: CollectionFlags);
}

/// Allocation and collection services the object model consumes.
pub trait GcBridge<'gc> {
    /// A zeroed instance of `ty`. Arrays and strings get length 0.
    fn allocate(&self, ty: TypeHandle) -> RuntimeResult<ObjectRef<'gc>>;
    fn allocate_array(&self, array_type: TypeHandle, length: usize) -> RuntimeResult<ObjectRef<'gc>>;
    fn allocate_string(&self, value: &str) -> RuntimeResult<ObjectRef<'gc>>;
    fn get_generation(&self, obj: ObjectRef<'gc>) -> RuntimeResult<u8>;
    fn suppress_finalize(&self, obj: ObjectRef<'gc>) -> RuntimeResult<()>;
    fn reregister_for_finalize(&self, obj: ObjectRef<'gc>) -> RuntimeResult<()>;
    fn total_heap_size(&self) -> u64;
    fn collect(&self, generation: i32, mode: CollectionMode) -> RuntimeResult<()>;
    fn collection_count(&self, generation: i32) -> RuntimeResult<u32>;
    fn max_generation(&self) -> u8;
    fn alloc_handle(&self, obj: ObjectRef<'gc>, kind: GCHandleType) -> GcHandleId;
    fn handle_get(&self, id: GcHandleId) -> RuntimeResult<ObjectRef<'gc>>;
    fn handle_set(&self, id: GcHandleId, obj: ObjectRef<'gc>) -> RuntimeResult<()>;
    fn free_handle(&self, id: GcHandleId) -> RuntimeResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CollectionRequest {
    generation: u8,
    flags: CollectionFlags,
}

/// Heap state that outlives any one mutation and may be touched from other
/// threads (pressure reports, metrics).
#[derive(Debug)]
pub struct HeapShared {
    config: RuntimeConfig,
    metrics: RuntimeMetrics,
    pressure: MemoryPressure,
    pending: Mutex<Option<CollectionRequest>>,
    live_bytes_after_gc: AtomicU64,
    epoch: Instant,
}

impl HeapShared {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            pressure: MemoryPressure::new(config.pressure),
            config,
            metrics: RuntimeMetrics::new(),
            pending: Mutex::new(None),
            live_bytes_after_gc: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn pressure(&self) -> &MemoryPressure {
        &self.pressure
    }

    pub fn add_memory_pressure(&self, bytes_allocated: i64) -> RuntimeResult<()> {
        self.pressure.add(bytes_allocated, self)
    }

    pub fn remove_memory_pressure(&self, bytes_allocated: i64) -> RuntimeResult<()> {
        self.pressure.remove(bytes_allocated, self)
    }

    pub fn has_pending_collection(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn queue_collection(&self, generation: u8, flags: CollectionFlags) {
        let mut pending = self.pending.lock();
        let merged = match *pending {
            Some(existing) => CollectionRequest {
                generation: existing.generation.max(generation),
                flags: existing.flags | flags,
            },
            None => CollectionRequest { generation, flags },
        };
        trace!(generation = merged.generation, flags = ?merged.flags, "collection queued");
        *pending = Some(merged);
    }

    fn take_pending(&self) -> Option<CollectionRequest> {
        self.pending.lock().take()
    }
}

impl GcStatus for HeapShared {
    fn collection_count(&self, generation: u8) -> u32 {
        self.metrics.collection_count(generation)
    }

    fn current_object_size(&self) -> u64 {
        self.metrics.heap_bytes.load(Ordering::Relaxed)
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn last_gc_start(&self, generation: u8) -> Duration {
        self.metrics.last_gc_start(generation)
    }

    fn last_gc_duration(&self, generation: u8) -> Duration {
        self.metrics.last_gc_duration(generation)
    }

    fn request_collection(&self, generation: u8, flags: CollectionFlags) {
        self.metrics.pressure_collections.fetch_add(1, Ordering::Relaxed);
        self.queue_collection(generation, flags);
    }
}

/// Everything a mutation needs: the arena's mutation handle, the root and
/// the shared heap state.
#[derive(Clone, Copy)]
pub struct GcContext<'a, 'gc> {
    mc: GCHandle<'gc>,
    heap: &'gc HeapManager<'gc>,
    shared: &'a HeapShared,
}

impl<'a, 'gc> GcContext<'a, 'gc> {
    pub fn mutation(&self) -> GCHandle<'gc> {
        self.mc
    }

    pub fn heap(&self) -> &'gc HeapManager<'gc> {
        self.heap
    }

    pub fn shared(&self) -> &'a HeapShared {
        self.shared
    }

    pub fn metrics(&self) -> &'a RuntimeMetrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &'a RuntimeConfig {
        &self.shared.config
    }

    fn check_allocatable(ty: TypeHandle) -> RuntimeResult<()> {
        ty.try_descriptor()?;
        if ty.is_interface() || ty.is_abstract() || ty.is_pointer() {
            return Err(RuntimeError::InvalidAllocation(ty.name().to_string()));
        }
        Ok(())
    }

    fn place(&self, ty: TypeHandle, storage: FieldStorage<'gc>) -> ObjectRef<'gc> {
        let obj = ObjectRef::new(self.mc, ObjectInner::new(ty, storage));
        self.heap.register(obj);
        if let Some(handle) = obj.0 {
            let size = handle.size_bytes();
            self.shared
                .metrics
                .heap_bytes
                .fetch_add(size as u64, Ordering::Relaxed);
            trace!(type_name = ty.name(), size, "allocated object");
        }
        obj
    }

    /// A new object with a copy of `source`, references included.
    pub(crate) fn allocate_copy(&self, source: &FieldStorage<'gc>) -> RuntimeResult<ObjectRef<'gc>> {
        let ty = source.type_handle();
        Self::check_allocatable(ty)?;
        Ok(self.place(ty, source.clone()))
    }

    /// Boxes the inline value `bytes` as an instance of the value type `ty`.
    /// Reference fields must be null in `bytes`; set them afterwards through
    /// [`FieldStorage::write_ref`].
    pub fn box_value(&self, ty: TypeHandle, bytes: &[u8]) -> RuntimeResult<ObjectRef<'gc>> {
        Self::check_allocatable(ty)?;
        if !ty.is_value_type() {
            return Err(RuntimeError::TypeMismatch {
                expected: "value type".to_string(),
                actual: ty.name().to_string(),
            });
        }
        if bytes.len() != ty.value_size() {
            return Err(RuntimeError::TypeMismatch {
                expected: format!("{} bytes for {}", ty.value_size(), ty.name()),
                actual: format!("{} bytes", bytes.len()),
            });
        }
        let mut storage = FieldStorage::zeroed(ty, ty.base_size() - HEADER_SIZE);
        storage.write_bytes(ByteOffset::ZERO, bytes)?;
        Ok(self.place(ty, storage))
    }

    pub fn allocate_string(&self, value: &str) -> RuntimeResult<ObjectRef<'gc>> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let obj = GcBridge::allocate_array(self, core_types().string, units.len())?;
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_ne_bytes()).collect();
        obj.with_payload_mut(self.mc, |p| {
            p.write_bytes(ByteOffset(ArrayLayoutManager::LENGTH_SIZE), &bytes)
        })??;
        Ok(obj)
    }

    /// `Activator.CreateInstance`: value types come back zeroed, reference
    /// types run their parameterless constructor.
    pub fn create_instance(
        &self,
        catalog: &impl TypeCatalog,
        ty: TypeHandle,
    ) -> RuntimeResult<ObjectRef<'gc>> {
        Self::check_allocatable(ty)?;
        if ty.is_value_type() {
            return GcBridge::allocate(self, ty);
        }
        if !catalog.has_default_constructor(ty) {
            return Err(RuntimeError::MissingDefaultConstructor(ty.name().to_string()));
        }
        let obj = GcBridge::allocate(self, ty)?;
        if let Some(ctor) = ty.methods().default_ctor {
            ctor(self, obj)?;
        }
        Ok(obj)
    }

    pub fn add_memory_pressure(&self, bytes_allocated: i64) -> RuntimeResult<()> {
        self.shared.add_memory_pressure(bytes_allocated)
    }

    pub fn remove_memory_pressure(&self, bytes_allocated: i64) -> RuntimeResult<()> {
        self.shared.remove_memory_pressure(bytes_allocated)
    }
}

impl<'a, 'gc> GcBridge<'gc> for GcContext<'a, 'gc> {
    fn allocate(&self, ty: TypeHandle) -> RuntimeResult<ObjectRef<'gc>> {
        Self::check_allocatable(ty)?;
        if ty.has_component_size() {
            return self.allocate_array(ty, 0);
        }
        let size = ty.base_size() - HEADER_SIZE;
        Ok(self.place(ty, FieldStorage::zeroed(ty, size)))
    }

    fn allocate_array(&self, array_type: TypeHandle, length: usize) -> RuntimeResult<ObjectRef<'gc>> {
        Self::check_allocatable(array_type)?;
        if !array_type.has_component_size() {
            return Err(RuntimeError::TypeMismatch {
                expected: "array or string type".to_string(),
                actual: array_type.name().to_string(),
            });
        }
        let size = length
            .checked_mul(array_type.component_size())
            .and_then(|s| s.checked_add(ArrayLayoutManager::LENGTH_SIZE))
            .filter(|s| *s <= isize::MAX as usize)
            .ok_or(RuntimeError::OutOfMemory)?;
        let mut storage = FieldStorage::zeroed(array_type, size);
        storage.write_usize(ByteOffset::ZERO, length)?;
        Ok(self.place(array_type, storage))
    }

    fn allocate_string(&self, value: &str) -> RuntimeResult<ObjectRef<'gc>> {
        GcContext::allocate_string(self, value)
    }

    fn get_generation(&self, obj: ObjectRef<'gc>) -> RuntimeResult<u8> {
        let handle = obj.0.ok_or(RuntimeError::ArgumentNull("obj"))?;
        Ok(handle.generation.get())
    }

    fn suppress_finalize(&self, obj: ObjectRef<'gc>) -> RuntimeResult<()> {
        let handle = obj.0.ok_or(RuntimeError::ArgumentNull("obj"))?;
        handle.finalizer_suppressed.set(true);
        Ok(())
    }

    fn reregister_for_finalize(&self, obj: ObjectRef<'gc>) -> RuntimeResult<()> {
        let handle = obj.0.ok_or(RuntimeError::ArgumentNull("obj"))?;
        handle.finalizer_suppressed.set(false);
        if handle.type_handle().has_finalizer() && !handle.finalizer_registered.get() {
            handle.finalizer_registered.set(true);
            self.heap.finalization_queue.borrow_mut().push(obj);
        }
        Ok(())
    }

    fn total_heap_size(&self) -> u64 {
        self.shared.current_object_size()
    }

    fn collect(&self, generation: i32, mode: CollectionMode) -> RuntimeResult<()> {
        if generation < 0 {
            return Err(RuntimeError::out_of_range(
                "generation",
                "Non-negative number required.",
            ));
        }
        let generation = generation.min(self.max_generation() as i32) as u8;
        self.shared.queue_collection(generation, mode.into());
        Ok(())
    }

    fn collection_count(&self, generation: i32) -> RuntimeResult<u32> {
        if generation < 0 {
            return Err(RuntimeError::out_of_range(
                "generation",
                "Non-negative number required.",
            ));
        }
        if generation > self.max_generation() as i32 {
            return Ok(0);
        }
        Ok(self.shared.metrics.collection_count(generation as u8))
    }

    fn max_generation(&self) -> u8 {
        self.shared.config.max_generation
    }

    fn alloc_handle(&self, obj: ObjectRef<'gc>, kind: GCHandleType) -> GcHandleId {
        let mut handles = self.heap.gchandles.borrow_mut();
        let entry = Some((obj, kind));
        match handles.iter().position(Option::is_none) {
            Some(free) => {
                handles[free] = entry;
                GcHandleId(free)
            }
            None => {
                handles.push(entry);
                GcHandleId(handles.len() - 1)
            }
        }
    }

    fn handle_get(&self, id: GcHandleId) -> RuntimeResult<ObjectRef<'gc>> {
        match self.heap.gchandles.borrow().get(id.0) {
            Some(Some((obj, _))) => Ok(*obj),
            _ => Err(RuntimeError::InvalidHandle),
        }
    }

    fn handle_set(&self, id: GcHandleId, obj: ObjectRef<'gc>) -> RuntimeResult<()> {
        match self.heap.gchandles.borrow_mut().get_mut(id.0) {
            Some(Some(entry)) => {
                entry.0 = obj;
                Ok(())
            }
            _ => Err(RuntimeError::InvalidHandle),
        }
    }

    fn free_handle(&self, id: GcHandleId) -> RuntimeResult<()> {
        match self.heap.gchandles.borrow_mut().get_mut(id.0) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(RuntimeError::InvalidHandle),
        }
    }
}

/// Owner of the arena. Not `Send`; share [`HeapShared`] across threads instead.
pub struct ManagedHeap {
    arena: HeapArena,
    shared: Arc<HeapShared>,
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl ManagedHeap {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            arena: HeapArena::new(|_| HeapManager::new()),
            shared: Arc::new(HeapShared::new(config)),
        }
    }

    pub fn shared(&self) -> Arc<HeapShared> {
        self.shared.clone()
    }

    /// Runs `f` against the heap, then performs any collection requested
    /// while it ran.
    pub fn mutate<R>(&mut self, f: impl for<'gc> FnOnce(&GcContext<'_, 'gc>) -> R) -> R {
        let shared = &*self.shared;
        let result = self
            .arena
            .mutate(|mc, heap| f(&GcContext { mc, heap, shared }));
        self.service_pending_collection();
        result
    }

    pub fn service_pending_collection(&mut self) {
        let Some(request) = self.shared.take_pending() else {
            return;
        };
        if request.flags.contains(CollectionFlags::OPTIMIZED)
            && !request.flags.contains(CollectionFlags::BLOCKING)
        {
            let live = self.shared.live_bytes_after_gc.load(Ordering::Relaxed);
            if self.shared.current_object_size() <= live {
                debug!(generation = request.generation, "optimized collection skipped");
                return;
            }
        }
        self.collect(request.generation, request.flags);
    }

    /// Full mark, finalization check and sweep, run immediately.
    pub fn collect(&mut self, generation: u8, flags: CollectionFlags) {
        let generation = generation.min(self.shared.config.max_generation);
        let started = Instant::now();
        let started_at = self.shared.now();
        debug!(generation, ?flags, "collection started");

        let shared = &*self.shared;
        let mut marked = None;
        while marked.is_none() {
            marked = self.arena.mark_all();
        }
        if let Some(marked) = marked {
            marked.finalize(|fc, heap| heap.finalize_check(fc, shared, generation));
        }
        self.arena.collect_all();

        let duration = started.elapsed();
        self.shared
            .metrics
            .record_collection(generation, started_at, duration);
        self.shared.live_bytes_after_gc.store(
            self.shared.current_object_size(),
            Ordering::Relaxed,
        );
        debug!(generation, ?duration, "collection finished");

        if self.shared.config.run_finalizers_after_collect {
            self.run_pending_finalizers();
        }
    }

    /// Runs the finalizer of every object queued by earlier collections.
    /// Returns how many ran.
    pub fn run_pending_finalizers(&mut self) -> usize {
        let shared = &*self.shared;
        self.arena.mutate(|mc, heap| {
            let ctx = GcContext { mc, heap, shared };
            let batch = std::mem::take(&mut *heap.pending_finalization.borrow_mut());
            let mut ran = 0;
            for obj in batch {
                let Ok(ty) = obj.type_handle() else {
                    continue;
                };
                if let Some(finalizer) = ty.methods().finalizer {
                    trace!(type_name = ty.name(), "running finalizer");
                    finalizer(&ctx, obj);
                    shared.metrics.record_finalizer();
                    ran += 1;
                }
            }
            ran
        })
    }

    pub fn total_heap_size(&self) -> u64 {
        self.shared.current_object_size()
    }

    pub fn collection_count(&self, generation: u8) -> u32 {
        self.shared.metrics.collection_count(generation)
    }

    pub fn object_count(&self) -> usize {
        self.arena.mutate(|_, heap| heap.object_count())
    }

    pub fn pending_finalizers(&self) -> usize {
        self.arena
            .mutate(|_, heap| heap.pending_finalization.borrow().len())
    }
}
