use super::{ElementType, TypeBuilder, TypeHandle};
use crate::{
    error::RuntimeResult,
    value::{primitives, string, ObjectRef},
    vm::gc::GcContext,
};
use std::sync::LazyLock;

/// Descriptors the object model itself depends on. They are built once per
/// process, the first time any of them is needed.
#[derive(Debug)]
pub struct CoreTypes {
    pub object: TypeHandle,
    pub value_type: TypeHandle,
    pub enum_type: TypeHandle,
    pub array: TypeHandle,
    pub string: TypeHandle,
    pub exception: TypeHandle,
    pub system_exception: TypeHandle,
    pub out_of_memory: TypeHandle,
    pub invalid_operation: TypeHandle,
    pub boolean: TypeHandle,
    pub char: TypeHandle,
    pub sbyte: TypeHandle,
    pub byte: TypeHandle,
    pub int16: TypeHandle,
    pub uint16: TypeHandle,
    pub int32: TypeHandle,
    pub uint32: TypeHandle,
    pub int64: TypeHandle,
    pub uint64: TypeHandle,
    pub intptr: TypeHandle,
    pub uintptr: TypeHandle,
    pub single: TypeHandle,
    pub double: TypeHandle,
}

static CORE_TYPES: LazyLock<CoreTypes> = LazyLock::new(CoreTypes::build);

pub fn core_types() -> &'static CoreTypes {
    &CORE_TYPES
}

fn trivial_ctor<'gc>(_: &GcContext<'_, 'gc>, _: ObjectRef<'gc>) -> RuntimeResult<()> {
    Ok(())
}

impl CoreTypes {
    fn build() -> Self {
        let object = TypeBuilder::class("System.Object")
            .base(TypeHandle::NULL)
            .default_ctor(trivial_ctor)
            .build();
        let value_type = TypeBuilder::class("System.ValueType")
            .base(object)
            .abstract_type()
            .build();
        let enum_type = TypeBuilder::class("System.Enum")
            .base(value_type)
            .abstract_type()
            .build();
        let array = TypeBuilder::class("System.Array")
            .base(object)
            .abstract_type()
            .build();
        let string = TypeBuilder::class("System.String")
            .base(object)
            .string_type()
            .equals(string::string_equals)
            .hash_code(string::string_hash_code)
            .build();
        let exception = TypeBuilder::class("System.Exception")
            .base(object)
            .default_ctor(trivial_ctor)
            .build();
        let system_exception = TypeBuilder::class("System.SystemException")
            .base(exception)
            .default_ctor(trivial_ctor)
            .build();
        let out_of_memory = TypeBuilder::class("System.OutOfMemoryException")
            .base(system_exception)
            .default_ctor(trivial_ctor)
            .build();
        let invalid_operation = TypeBuilder::class("System.InvalidOperationException")
            .base(system_exception)
            .default_ctor(trivial_ctor)
            .build();

        let primitive = |name: &str, element: ElementType| {
            TypeBuilder::primitive(name, element)
                .base(value_type)
                .equals(primitives::primitive_equals)
                .hash_code(primitives::primitive_hash_code)
                .build()
        };

        Self {
            object,
            value_type,
            enum_type,
            array,
            string,
            exception,
            system_exception,
            out_of_memory,
            invalid_operation,
            boolean: primitive("System.Boolean", ElementType::Boolean),
            char: primitive("System.Char", ElementType::Char),
            sbyte: primitive("System.SByte", ElementType::I1),
            byte: primitive("System.Byte", ElementType::U1),
            int16: primitive("System.Int16", ElementType::I2),
            uint16: primitive("System.UInt16", ElementType::U2),
            int32: primitive("System.Int32", ElementType::I4),
            uint32: primitive("System.UInt32", ElementType::U4),
            int64: primitive("System.Int64", ElementType::I8),
            uint64: primitive("System.UInt64", ElementType::U8),
            intptr: primitive("System.IntPtr", ElementType::I),
            uintptr: primitive("System.UIntPtr", ElementType::U),
            single: primitive("System.Single", ElementType::R4),
            double: primitive("System.Double", ElementType::R8),
        }
    }

    pub fn all(&self) -> [TypeHandle; 23] {
        [
            self.object,
            self.value_type,
            self.enum_type,
            self.array,
            self.string,
            self.exception,
            self.system_exception,
            self.out_of_memory,
            self.invalid_operation,
            self.boolean,
            self.char,
            self.sbyte,
            self.byte,
            self.int16,
            self.uint16,
            self.int32,
            self.uint32,
            self.int64,
            self.uint64,
            self.intptr,
            self.uintptr,
            self.single,
            self.double,
        ]
    }
}
