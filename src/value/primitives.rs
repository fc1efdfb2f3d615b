//! `Equals` and `GetHashCode` for boxed primitives.
use crate::{
    error::RuntimeResult,
    types::ElementType,
    utils::ByteOffset,
    value::ObjectRef,
    vm::gc::GcContext,
};

pub fn primitive_equals<'gc>(
    _ctx: &GcContext<'_, 'gc>,
    this: ObjectRef<'gc>,
    other: ObjectRef<'gc>,
) -> RuntimeResult<bool> {
    let ty = this.type_handle()?;
    if other.is_null() || !ty.fast_equals(other.type_handle()?) {
        return Ok(false);
    }
    let at = ByteOffset::ZERO;
    match ty.element_type() {
        ElementType::R4 => {
            let a = this.with_payload(|p| p.read_f32(at))??;
            let b = other.with_payload(|p| p.read_f32(at))??;
            Ok(a == b || (a.is_nan() && b.is_nan()))
        }
        ElementType::R8 => {
            let a = this.with_payload(|p| p.read_f64(at))??;
            let b = other.with_payload(|p| p.read_f64(at))??;
            Ok(a == b || (a.is_nan() && b.is_nan()))
        }
        _ => {
            let size = ty.value_size();
            let a = this.with_payload(|p| p.read_bytes(at, size).map(<[u8]>::to_vec))??;
            let b = other.with_payload(|p| p.read_bytes(at, size).map(<[u8]>::to_vec))??;
            Ok(a == b)
        }
    }
}

pub fn primitive_hash_code<'gc>(_ctx: &GcContext<'_, 'gc>, this: ObjectRef<'gc>) -> RuntimeResult<i32> {
    let ty = this.type_handle()?;
    let at = ByteOffset::ZERO;
    this.with_payload(|p| -> RuntimeResult<i32> {
        Ok(match ty.element_type() {
            ElementType::Boolean => p.read_bool(at)? as i32,
            ElementType::Char | ElementType::U2 => {
                let c = p.read_u16(at)? as i32;
                if ty.element_type() == ElementType::Char {
                    c | (c << 16)
                } else {
                    c
                }
            }
            ElementType::I1 => {
                let v = p.read_i8(at)? as i32;
                v ^ (v << 8)
            }
            ElementType::U1 => p.read_u8(at)? as i32,
            ElementType::I2 => {
                let v = p.read_i16(at)?;
                (v as u16 as i32) | ((v as i32) << 16)
            }
            ElementType::I4 => p.read_i32(at)?,
            ElementType::U4 => p.read_u32(at)? as i32,
            ElementType::I8 | ElementType::U8 => fold_i64(p.read_i64(at)?),
            ElementType::I | ElementType::U => fold_i64(p.read_isize(at)? as i64),
            ElementType::R4 => single_hash(p.read_f32(at)?),
            ElementType::R8 => double_hash(p.read_f64(at)?),
            _ => this.identity_hash_code()?,
        })
    })?
}

fn fold_i64(v: i64) -> i32 {
    (v as i32) ^ ((v >> 32) as i32)
}

/// Positive and negative zero hash alike, as do all NaNs.
pub fn single_hash(value: f32) -> i32 {
    let mut bits = value.to_bits() as i32;
    if (bits.wrapping_sub(1) & 0x7fff_ffff) >= 0x7f80_0000 {
        bits &= 0x7f80_0000;
    }
    bits
}

pub fn double_hash(value: f64) -> i32 {
    let mut bits = value.to_bits() as i64;
    if (bits.wrapping_sub(1) & 0x7fff_ffff_ffff_ffff) >= 0x7ff0_0000_0000_0000 {
        bits &= 0x7ff0_0000_0000_0000;
    }
    fold_i64(bits)
}
