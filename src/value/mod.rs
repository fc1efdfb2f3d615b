//! Heap objects: the header every allocation starts with, the payload that
//! follows it and the references that point at both.
use crate::{
    error::{RuntimeError, RuntimeResult},
    types::TypeHandle,
    vm::gc::GCHandle,
};
use gc_arena::{barrier::Unlock, lock::RefLock, Collect, Collection, Gc};
use std::{
    cell::{Cell, Ref},
    cmp::Ordering,
    collections::HashSet,
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    mem::offset_of,
};

pub mod equality;
pub mod layout;
pub mod object;
pub mod primitives;
pub mod storage;
pub mod string;

use storage::FieldStorage;

/// The fixed prefix of every heap allocation: a single type handle.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ObjectHeader {
    pub type_handle: TypeHandle,
}

pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();

/// Where the collector finds an object's type handle.
pub const TYPE_HANDLE_OFFSET: usize = 0;

const _: () = assert!(HEADER_SIZE == size_of::<usize>());
const _: () = assert!(offset_of!(ObjectHeader, type_handle) == 0);
const _: () = assert!(offset_of!(ObjectInner<'static>, header) == TYPE_HANDLE_OFFSET);

/// One heap allocation. The header sits at offset 0; everything after it is
/// bookkeeping for this runtime or the type-specific payload.
#[repr(C)]
pub struct ObjectInner<'gc> {
    header: ObjectHeader,
    /// Identity hash, 0 until first requested.
    pub(crate) hash_code: Cell<i32>,
    pub(crate) generation: Cell<u8>,
    pub(crate) finalizer_registered: Cell<bool>,
    pub(crate) finalizer_suppressed: Cell<bool>,
    storage: RefLock<FieldStorage<'gc>>,
}

unsafe impl<'gc> Collect for ObjectInner<'gc> {
    fn trace(&self, cc: &Collection) {
        self.storage.trace(cc);
    }
}

impl<'gc> ObjectInner<'gc> {
    pub(crate) fn new(type_handle: TypeHandle, storage: FieldStorage<'gc>) -> Self {
        Self {
            header: ObjectHeader { type_handle },
            hash_code: Cell::new(0),
            generation: Cell::new(0),
            finalizer_registered: Cell::new(false),
            finalizer_suppressed: Cell::new(false),
            storage: RefLock::new(storage),
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn type_handle(&self) -> TypeHandle {
        self.header.type_handle
    }

    pub fn storage(&self) -> Ref<'_, FieldStorage<'gc>> {
        self.storage.borrow()
    }

    /// Header plus payload, rounded up to a machine word.
    pub fn size_bytes(&self) -> usize {
        HEADER_SIZE + crate::utils::align_up(self.storage.borrow().len(), size_of::<usize>())
    }
}

pub type ObjectPtr = *const ObjectInner<'static>;
pub type ObjectHandle<'gc> = Gc<'gc, ObjectInner<'gc>>;

#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct ObjectRef<'gc>(pub Option<ObjectHandle<'gc>>);

unsafe impl<'gc> Collect for ObjectRef<'gc> {
    fn trace(&self, cc: &Collection) {
        if let Some(h) = self.0 {
            h.trace(cc);
        }
    }
}

// stored inline in payloads as a single machine word
const _: () = assert!(ObjectRef::SIZE == size_of::<usize>());

impl PartialEq for ObjectRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Some(l), Some(r)) => Gc::ptr_eq(l, r),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialOrd for ObjectRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectRef<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_raw().cmp(&other.as_raw())
    }
}

impl Eq for ObjectRef<'_> {}

impl Hash for ObjectRef<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_raw().hash(state);
    }
}

impl<'gc> ObjectRef<'gc> {
    pub const SIZE: usize = size_of::<ObjectRef>();
    pub const NULL: Self = ObjectRef(None);

    pub(crate) fn new(gc: GCHandle<'gc>, value: ObjectInner<'gc>) -> Self {
        Self(Some(Gc::new(gc, value)))
    }

    pub fn is_null(self) -> bool {
        self.0.is_none()
    }

    pub fn as_raw(self) -> usize {
        match self.0 {
            Some(h) => Gc::as_ptr(h) as usize,
            None => 0,
        }
    }

    pub fn handle(self) -> RuntimeResult<ObjectHandle<'gc>> {
        self.0.ok_or(RuntimeError::NullReference)
    }

    /// Reinterprets the first word of `source` as a reference.
    ///
    /// # Safety
    ///
    /// The word must be zero or have been written by [`ObjectRef::write`] from
    /// a reference into the same arena that is still traced.
    pub(crate) unsafe fn read_unchecked(source: &[u8]) -> Self {
        let mut ptr_bytes = [0u8; Self::SIZE];
        ptr_bytes.copy_from_slice(&source[0..Self::SIZE]);
        let ptr = usize::from_ne_bytes(ptr_bytes) as *const ObjectInner<'gc>;

        if ptr.is_null() {
            ObjectRef(None)
        } else {
            // SAFETY: guaranteed by the caller
            ObjectRef(Some(unsafe { Gc::from_ptr(ptr) }))
        }
    }

    pub fn write(&self, dest: &mut [u8]) {
        let ptr_bytes = self.as_raw().to_ne_bytes();
        dest[..ptr_bytes.len()].copy_from_slice(&ptr_bytes);
    }

    pub fn resurrect(&self, fc: &gc_arena::Finalization<'gc>, visited: &mut HashSet<usize>) {
        if let Some(handle) = self.0 {
            let ptr = Gc::as_ptr(handle) as usize;
            if visited.insert(ptr) {
                Gc::resurrect(fc, handle);
                let storage = handle.storage.borrow();
                storage.for_each_ref(|r| r.resurrect(fc, visited));
            }
        }
    }

    pub fn with_payload<T>(self, op: impl FnOnce(&FieldStorage<'gc>) -> T) -> RuntimeResult<T> {
        let handle = self.handle()?;
        let storage = handle.storage.borrow();
        Ok(op(&storage))
    }

    pub fn with_payload_mut<T>(
        self,
        gc: GCHandle<'gc>,
        op: impl FnOnce(&mut FieldStorage<'gc>) -> T,
    ) -> RuntimeResult<T> {
        let handle = self.handle()?;
        Gc::write(gc, handle);
        // SAFETY: the write barrier for this allocation has just been triggered
        let mut storage = unsafe { handle.storage.unlock_unchecked() }.borrow_mut();
        Ok(op(&mut storage))
    }
}

impl Debug for ObjectRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => f.write_str("NULL"),
            Some(gc) => write!(f, "{} @ {:#x}", gc.type_handle(), Gc::as_ptr(gc) as usize),
        }
    }
}
