use super::{core_types, TypeHandle};
use crate::utils::ByteOffset;
use parking_lot::RwLock;
use std::{any::TypeId, collections::HashMap};
use tracing::debug;

/// Resolution of static types to handles, as the compiler would provide it.
pub trait TypeCatalog {
    fn resolve_handle(&self, ty: TypeId) -> Option<TypeHandle>;

    fn resolve_by_name(&self, name: &str) -> Option<TypeHandle>;

    /// Whether `create_instance` can build `ty` without arguments. Value
    /// types always can.
    fn has_default_constructor(&self, ty: TypeHandle) -> bool {
        !ty.is_null() && (ty.is_value_type() || ty.methods().default_ctor.is_some())
    }

    /// Fields compared one by one when boxed instances of `ty` are compared.
    fn equatable_fields(&self, ty: TypeHandle) -> Vec<(ByteOffset, TypeHandle)> {
        if ty.is_null() {
            return vec![];
        }
        ty.equatable_fields().collect()
    }

    fn resolve<T: 'static>(&self) -> Option<TypeHandle>
    where
        Self: Sized,
    {
        self.resolve_handle(TypeId::of::<T>())
    }
}

#[derive(Debug)]
pub struct TypeRegistry {
    by_id: RwLock<HashMap<TypeId, TypeHandle>>,
    by_name: RwLock<HashMap<String, TypeHandle>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry seeded with the core types, with Rust primitives mapped
    /// onto their runtime counterparts.
    pub fn new() -> Self {
        let registry = Self {
            by_id: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
        };
        let core = core_types();
        for ty in core.all() {
            registry.register_named(ty);
        }
        registry.register::<bool>(core.boolean);
        registry.register::<char>(core.char);
        registry.register::<i8>(core.sbyte);
        registry.register::<u8>(core.byte);
        registry.register::<i16>(core.int16);
        registry.register::<u16>(core.uint16);
        registry.register::<i32>(core.int32);
        registry.register::<u32>(core.uint32);
        registry.register::<i64>(core.int64);
        registry.register::<u64>(core.uint64);
        registry.register::<isize>(core.intptr);
        registry.register::<usize>(core.uintptr);
        registry.register::<f32>(core.single);
        registry.register::<f64>(core.double);
        registry.register::<String>(core.string);
        registry
    }

    pub fn register_named(&self, ty: TypeHandle) {
        if ty.is_null() {
            return;
        }
        debug!(name = ty.name(), "registered type");
        self.by_name.write().insert(ty.name().to_string(), ty);
    }

    /// Binds the Rust type `T` to `ty` and makes `ty` resolvable by name.
    pub fn register<T: 'static>(&self, ty: TypeHandle) {
        self.by_id.write().insert(TypeId::of::<T>(), ty);
        self.register_named(ty);
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TypeCatalog for TypeRegistry {
    fn resolve_handle(&self, ty: TypeId) -> Option<TypeHandle> {
        self.by_id.read().get(&ty).copied()
    }

    fn resolve_by_name(&self, name: &str) -> Option<TypeHandle> {
        self.by_name.read().get(name).copied()
    }
}
