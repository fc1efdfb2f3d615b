use super::{core_types, ElementType, TypeHandle};
use std::fmt::{self, Display, Formatter};

/// Reflection-facing view of a type handle, as returned by `GetType`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum RuntimeType {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    IntPtr,
    UIntPtr,
    Object,
    String,
    Type(TypeHandle),
    Vector(Box<RuntimeType>),
    Pointer(Box<RuntimeType>),
}

impl RuntimeType {
    pub fn from_handle(handle: TypeHandle) -> Self {
        if handle.is_sz_array() {
            return RuntimeType::Vector(Box::new(Self::from_handle(handle.related_type())));
        }
        if handle.is_pointer() {
            return RuntimeType::Pointer(Box::new(Self::from_handle(handle.related_type())));
        }
        if handle.is_string() {
            return RuntimeType::String;
        }
        if handle.equals(core_types().object) {
            return RuntimeType::Object;
        }
        if handle.is_primitive() {
            return match handle.element_type() {
                ElementType::Boolean => RuntimeType::Boolean,
                ElementType::Char => RuntimeType::Char,
                ElementType::I1 => RuntimeType::Int8,
                ElementType::U1 => RuntimeType::UInt8,
                ElementType::I2 => RuntimeType::Int16,
                ElementType::U2 => RuntimeType::UInt16,
                ElementType::I4 => RuntimeType::Int32,
                ElementType::U4 => RuntimeType::UInt32,
                ElementType::I8 => RuntimeType::Int64,
                ElementType::U8 => RuntimeType::UInt64,
                ElementType::R4 => RuntimeType::Float32,
                ElementType::R8 => RuntimeType::Float64,
                ElementType::I => RuntimeType::IntPtr,
                ElementType::U => RuntimeType::UIntPtr,
                _ => RuntimeType::Type(handle.canonical()),
            };
        }
        RuntimeType::Type(handle.canonical())
    }

    pub fn to_handle(&self) -> TypeHandle {
        let core = core_types();
        match self {
            RuntimeType::Boolean => core.boolean,
            RuntimeType::Char => core.char,
            RuntimeType::Int8 => core.sbyte,
            RuntimeType::UInt8 => core.byte,
            RuntimeType::Int16 => core.int16,
            RuntimeType::UInt16 => core.uint16,
            RuntimeType::Int32 => core.int32,
            RuntimeType::UInt32 => core.uint32,
            RuntimeType::Int64 => core.int64,
            RuntimeType::UInt64 => core.uint64,
            RuntimeType::Float32 => core.single,
            RuntimeType::Float64 => core.double,
            RuntimeType::IntPtr => core.intptr,
            RuntimeType::UIntPtr => core.uintptr,
            RuntimeType::Object => core.object,
            RuntimeType::String => core.string,
            RuntimeType::Type(t) => *t,
            RuntimeType::Vector(e) => super::TypeBuilder::array_of(e.to_handle()),
            RuntimeType::Pointer(e) => super::TypeBuilder::pointer_to(e.to_handle()),
        }
    }

    pub fn is_value_type(&self) -> bool {
        match self {
            RuntimeType::Object
            | RuntimeType::String
            | RuntimeType::Vector(_)
            | RuntimeType::Pointer(_) => false,
            RuntimeType::Type(t) => t.is_value_type(),
            _ => true,
        }
    }
}

impl Display for RuntimeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Vector(e) => write!(f, "{e}[]"),
            RuntimeType::Pointer(e) => write!(f, "{e}*"),
            RuntimeType::Type(t) => f.write_str(t.name()),
            other => f.write_str(other.to_handle().name()),
        }
    }
}
