use crate::{
    error::{RuntimeError, RuntimeResult},
    utils::ByteOffset,
    value::{layout::ArrayLayoutManager, storage::FieldStorage, ObjectRef},
    vm::gc::GcContext,
};

fn utf16_units(storage: &FieldStorage<'_>) -> RuntimeResult<Vec<u16>> {
    let length = storage.array_length()?;
    let bytes = storage.read_bytes(ByteOffset(ArrayLayoutManager::LENGTH_SIZE), length * 2)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect())
}

impl<'gc> ObjectRef<'gc> {
    pub fn is_string(self) -> bool {
        self.type_handle().is_ok_and(|t| t.is_string())
    }

    pub fn string_units(self) -> RuntimeResult<Vec<u16>> {
        let ty = self.type_handle()?;
        if !ty.is_string() {
            return Err(RuntimeError::TypeMismatch {
                expected: "System.String".to_string(),
                actual: ty.name().to_string(),
            });
        }
        self.with_payload(utf16_units)?
    }

    /// Lossy for unpaired surrogates.
    pub fn as_string(self) -> RuntimeResult<String> {
        Ok(String::from_utf16_lossy(&self.string_units()?))
    }
}

pub fn string_equals<'gc>(
    _ctx: &GcContext<'_, 'gc>,
    this: ObjectRef<'gc>,
    other: ObjectRef<'gc>,
) -> RuntimeResult<bool> {
    if this.reference_equals(other) {
        return Ok(true);
    }
    if other.is_null() || !other.is_string() {
        return Ok(false);
    }
    Ok(this.string_units()? == other.string_units()?)
}

/// Content hash; equal strings hash alike within a process.
pub fn string_hash_code<'gc>(_ctx: &GcContext<'_, 'gc>, this: ObjectRef<'gc>) -> RuntimeResult<i32> {
    let mut hash: u32 = 0x811c_9dc5;
    for unit in this.string_units()? {
        for byte in unit.to_le_bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    Ok(hash as i32)
}
