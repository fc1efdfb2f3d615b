//! Runtime type descriptors and the handles that point at them.
use crate::{
    error::RuntimeResult,
    value::{layout::LayoutManager, ObjectRef},
    vm::gc::GcContext,
};
use bitflags::bitflags;
use std::fmt::{self, Debug, Formatter};

mod builder;
mod catalog;
mod handle;
pub mod runtime;
mod well_known;

pub use builder::TypeBuilder;
pub use catalog::{TypeCatalog, TypeRegistry};
pub use handle::TypeHandle;
pub use runtime::RuntimeType;
pub use well_known::{core_types, CoreTypes};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EETypeFlags: u32 {
        const VALUE_TYPE = 0x0008;
        const HAS_FINALIZER = 0x0010;
        const HAS_POINTERS = 0x0020;
        const RUNTIME_ALLOCATED = 0x0040;
        const IS_INTERFACE = 0x0200;
        const IS_GENERIC = 0x0400;
        const IS_ABSTRACT = 0x0001_0000;
        const IS_PRIMITIVE = 0x0002_0000;
        const IS_ENUM = 0x0004_0000;
        const IS_STRING = 0x0008_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EETypeKind {
    Canonical,
    /// Duplicate descriptor for a type whose canonical descriptor lives elsewhere.
    Cloned,
    /// Array or pointer over the related (element) type.
    Parameterized,
    GenericTypeDefinition,
}

/// Element type numbering, matching the metadata encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Unknown = 0x00,
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    String = 0x0e,
    Ptr = 0x0f,
    ValueType = 0x11,
    Class = 0x12,
    Array = 0x14,
    I = 0x18,
    U = 0x19,
    Object = 0x1c,
    SzArray = 0x1d,
}

impl ElementType {
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ElementType::Boolean
                | ElementType::Char
                | ElementType::I1
                | ElementType::U1
                | ElementType::I2
                | ElementType::U2
                | ElementType::I4
                | ElementType::U4
                | ElementType::I8
                | ElementType::U8
                | ElementType::R4
                | ElementType::R8
                | ElementType::I
                | ElementType::U
        )
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, ElementType::R4 | ElementType::R8)
    }
}

pub type EqualsFn =
    for<'a, 'gc> fn(&GcContext<'a, 'gc>, ObjectRef<'gc>, ObjectRef<'gc>) -> RuntimeResult<bool>;
pub type HashCodeFn = for<'a, 'gc> fn(&GcContext<'a, 'gc>, ObjectRef<'gc>) -> RuntimeResult<i32>;
pub type CtorFn = for<'a, 'gc> fn(&GcContext<'a, 'gc>, ObjectRef<'gc>) -> RuntimeResult<()>;
pub type FinalizerFn = for<'a, 'gc> fn(&GcContext<'a, 'gc>, ObjectRef<'gc>);

/// Per-type virtual slots the object model dispatches through.
#[derive(Clone, Copy, Default)]
pub struct TypeMethods {
    pub equals: Option<EqualsFn>,
    pub hash_code: Option<HashCodeFn>,
    pub default_ctor: Option<CtorFn>,
    pub finalizer: Option<FinalizerFn>,
}

impl Debug for TypeMethods {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMethods")
            .field("equals", &self.equals.is_some())
            .field("hash_code", &self.hash_code.is_some())
            .field("default_ctor", &self.default_ctor.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// The runtime's description of one type. Descriptors are built once and live
/// for the rest of the process; [`TypeHandle`] is the pointer to one.
#[derive(Clone)]
pub struct EEType {
    pub(crate) name: Box<str>,
    pub(crate) kind: EETypeKind,
    pub(crate) flags: EETypeFlags,
    pub(crate) element_type: ElementType,
    /// Header plus payload for a zero-length instance, pointer aligned.
    pub(crate) base_size: u32,
    /// Per-element size for arrays and strings, 0 otherwise.
    pub(crate) component_size: u16,
    /// Exact size of the payload region (the unboxed value for value types).
    pub(crate) value_size: u32,
    pub(crate) base_type: TypeHandle,
    pub(crate) related_type: TypeHandle,
    /// Parameterized types only: 0 for pointers, the rank for arrays.
    pub(crate) shape: u32,
    pub(crate) layout: LayoutManager,
    pub(crate) gc_slots: Box<[usize]>,
    pub(crate) hash: u32,
    pub(crate) special_fields: u16,
    pub(crate) methods: TypeMethods,
}

impl EEType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EETypeKind {
        self.kind
    }

    pub fn flags(&self) -> EETypeFlags {
        self.flags
    }
}

impl Debug for EEType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EEType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("base_size", &self.base_size)
            .field("component_size", &self.component_size)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .finish_non_exhaustive()
    }
}
