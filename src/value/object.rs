use crate::{
    error::{RuntimeError, RuntimeResult},
    types::{RuntimeType, TypeHandle},
    utils::get_current_thread_id,
    value::{equality, ObjectRef},
    vm::gc::GcContext,
};
use std::cell::Cell;

/// Identity hashes fit in the bits an object header can spare for them.
pub const HASHCODE_BITS: u32 = 26;
pub const MASK_HASHCODE: i32 = (1 << HASHCODE_BITS) - 1;

thread_local! {
    static HASH_SEED: Cell<i32> = const { Cell::new(0) };
}

/// Next value from the calling thread's hash sequence. Threads use different
/// multipliers so their sequences do not line up.
fn new_hash_code() -> i32 {
    let multiplier = (get_current_thread_id() as i32).wrapping_mul(4).wrapping_add(5);
    HASH_SEED.with(|seed| {
        let next = seed.get().wrapping_mul(multiplier).wrapping_add(1);
        seed.set(next);
        next
    })
}

impl<'gc> ObjectRef<'gc> {
    pub fn type_handle(self) -> RuntimeResult<TypeHandle> {
        Ok(self.handle()?.type_handle())
    }

    /// Reflection view of the instance's type; fixed for the object's lifetime.
    pub fn get_type(self) -> RuntimeResult<RuntimeType> {
        Ok(RuntimeType::from_handle(self.type_handle()?))
    }

    pub fn reference_equals(self, other: ObjectRef<'gc>) -> bool {
        self == other
    }

    /// Stable for the object's lifetime and independent of its payload.
    pub fn identity_hash_code(self) -> RuntimeResult<i32> {
        let handle = self.handle()?;
        let current = handle.hash_code.get();
        if current != 0 {
            return Ok(current);
        }
        let mut hash = new_hash_code() & MASK_HASHCODE;
        if hash == 0 {
            hash = 1;
        }
        // arenas are single threaded, so installing through the cell cannot race
        handle.hash_code.set(hash);
        Ok(hash)
    }

    /// Virtual `Equals`: the type's override, then value equality for value
    /// types, then reference identity.
    pub fn equals(self, ctx: &GcContext<'_, 'gc>, other: ObjectRef<'gc>) -> RuntimeResult<bool> {
        let ty = self.type_handle()?;
        if let Some(equals) = ty.methods().equals {
            return equals(ctx, self, other);
        }
        if ty.is_value_type() {
            return equality::value_type_equals(ctx, self, other);
        }
        Ok(self.reference_equals(other))
    }

    /// Virtual `GetHashCode`. Value types without an override have no hash.
    pub fn hash_code(self, ctx: &GcContext<'_, 'gc>) -> RuntimeResult<i32> {
        let ty = self.type_handle()?;
        if let Some(hash_code) = ty.methods().hash_code {
            return hash_code(ctx, self);
        }
        if ty.is_value_type() {
            return Err(RuntimeError::HashNotSupported(ty.name().to_string()));
        }
        self.identity_hash_code()
    }

    /// Shallow copy: same type, bit-for-bit payload. References are shared.
    pub fn memberwise_clone(self, ctx: &GcContext<'_, 'gc>) -> RuntimeResult<ObjectRef<'gc>> {
        self.with_payload(|p| ctx.allocate_copy(p))?
    }

    pub fn array_length(self) -> RuntimeResult<usize> {
        self.with_payload(|p| p.array_length())?
    }
}
