//! Default equality for value types.
//!
//! A value type compares its raw bytes when every field can be compared that
//! way. Otherwise each field is boxed and compared through its own virtual
//! `Equals`. Which path a type takes is fixed when its descriptor is built
//! (see [`TypeHandle::special_field_count`]).
use crate::{
    error::RuntimeResult,
    types::{core_types, TypeHandle},
    utils::ByteOffset,
    value::ObjectRef,
    vm::gc::GcContext,
};

/// Per-type enumerator of the fields field-wise equality walks.
pub trait EquatableFields {
    fn equatable_fields(&self) -> Vec<(ByteOffset, TypeHandle)>;
}

impl EquatableFields for TypeHandle {
    fn equatable_fields(&self) -> Vec<(ByteOffset, TypeHandle)> {
        TypeHandle::equatable_fields(*self).collect()
    }
}

/// `ValueType.Equals`: nominal type check first, then bytes or fields.
pub fn value_type_equals<'gc>(
    ctx: &GcContext<'_, 'gc>,
    this: ObjectRef<'gc>,
    obj: ObjectRef<'gc>,
) -> RuntimeResult<bool> {
    let this_type = this.type_handle()?;
    if obj.is_null() {
        return Ok(false);
    }
    if !this_type.fast_equals(obj.type_handle()?) {
        return Ok(false);
    }

    if this_type.special_field_count() == 0 {
        return payload_bytes_equal(this, obj, this_type.value_size());
    }

    for (offset, field_type) in this_type.equatable_fields() {
        let this_field = box_field(ctx, this, offset, field_type)?;
        let that_field = box_field(ctx, obj, offset, field_type)?;
        if this_field.is_null() {
            if !that_field.is_null() {
                return Ok(false);
            }
        } else if !this_field.equals(ctx, that_field)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `RuntimeHelpers.Equals`: identity, or two boxed values of the same type
/// whose bytes match exactly.
pub fn bitwise_equals<'gc>(a: ObjectRef<'gc>, b: ObjectRef<'gc>) -> RuntimeResult<bool> {
    if a.reference_equals(b) {
        return Ok(true);
    }
    if a.is_null() || b.is_null() {
        return Ok(false);
    }
    let ty = a.type_handle()?;
    if !ty.is_value_type() || !ty.fast_equals(b.type_handle()?) {
        return Ok(false);
    }
    payload_bytes_equal(a, b, ty.value_size())
}

fn payload_bytes_equal<'gc>(a: ObjectRef<'gc>, b: ObjectRef<'gc>, size: usize) -> RuntimeResult<bool> {
    a.with_payload(|left| {
        b.with_payload(|right| -> RuntimeResult<bool> {
            Ok(left.read_bytes(ByteOffset::ZERO, size)? == right.read_bytes(ByteOffset::ZERO, size)?)
        })
    })??
}

/// The field at `offset` as an object: references are returned as is, inline
/// values are copied into a fresh box of the field's type.
fn box_field<'gc>(
    ctx: &GcContext<'_, 'gc>,
    owner: ObjectRef<'gc>,
    offset: ByteOffset,
    field_type: TypeHandle,
) -> RuntimeResult<ObjectRef<'gc>> {
    if field_type.is_pointer() {
        let bytes = owner.with_payload(|p| p.read_bytes(offset, size_of::<usize>()).map(<[u8]>::to_vec))??;
        return ctx.box_value(core_types().intptr, &bytes);
    }
    if !field_type.is_value_type() {
        return owner.with_payload(|p| p.read_ref(offset))?;
    }
    let boxed = owner.with_payload(|p| p.inline_value(field_type, offset))??;
    ctx.allocate_copy(&boxed)
}
