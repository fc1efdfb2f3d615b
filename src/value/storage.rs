use crate::{
    error::{RuntimeError, RuntimeResult},
    types::TypeHandle,
    utils::ByteOffset,
    value::{layout::ArrayLayoutManager, ObjectRef, HEADER_SIZE},
};
use gc_arena::{Collect, Collection};
use std::{marker::PhantomData, ops::Range};

/// The payload region of one heap object: raw bytes interpreted through the
/// object's type handle.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldStorage<'gc> {
    type_handle: TypeHandle,
    storage: Box<[u8]>,
    _contains_gc: PhantomData<&'gc ()>,
}

unsafe impl Collect for FieldStorage<'_> {
    #[inline]
    fn trace(&self, cc: &Collection) {
        self.for_each_ref(|r| r.trace(cc));
    }
}

macro_rules! scalar_accessors {
    ($($read:ident, $write:ident: $t:ty;)*) => {
        $(
            pub fn $read(&self, offset: ByteOffset) -> RuntimeResult<$t> {
                let range = self.range(offset, size_of::<$t>())?;
                let mut bytes = [0u8; size_of::<$t>()];
                bytes.copy_from_slice(&self.storage[range]);
                Ok(<$t>::from_ne_bytes(bytes))
            }

            pub fn $write(&mut self, offset: ByteOffset, value: $t) -> RuntimeResult<()> {
                let bytes = value.to_ne_bytes();
                let range = self.range(offset, bytes.len())?;
                self.check_raw_write(&range, &bytes)?;
                self.storage[range].copy_from_slice(&bytes);
                Ok(())
            }
        )*
    };
}

impl<'gc> FieldStorage<'gc> {
    /// Zero-filled payload of `size` bytes.
    pub fn zeroed(type_handle: TypeHandle, size: usize) -> Self {
        Self {
            type_handle,
            storage: vec![0; size].into_boxed_slice(),
            _contains_gc: PhantomData,
        }
    }

    pub fn type_handle(&self) -> TypeHandle {
        self.type_handle
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn get(&self) -> &[u8] {
        &self.storage
    }

    fn range(&self, offset: ByteOffset, size: usize) -> RuntimeResult<Range<usize>> {
        let start = offset.as_usize();
        match start.checked_add(size) {
            Some(end) if end <= self.storage.len() => Ok(start..end),
            _ => Err(RuntimeError::OutOfBounds {
                type_name: self.type_handle.name().to_string(),
                offset: start,
                size,
                length: self.storage.len(),
            }),
        }
    }

    pub fn read_bytes(&self, offset: ByteOffset, size: usize) -> RuntimeResult<&[u8]> {
        let range = self.range(offset, size)?;
        Ok(&self.storage[range])
    }

    /// Raw writes may clear a reference slot they cover completely; any other
    /// write touching a reference slot fails with [`RuntimeError::ReferenceOverlap`].
    pub fn write_bytes(&mut self, offset: ByteOffset, bytes: &[u8]) -> RuntimeResult<()> {
        let range = self.range(offset, bytes.len())?;
        self.check_raw_write(&range, bytes)?;
        self.storage[range].copy_from_slice(bytes);
        Ok(())
    }

    fn check_raw_write(&self, range: &Range<usize>, bytes: &[u8]) -> RuntimeResult<()> {
        let word = ObjectRef::SIZE;
        let clobbered = self.find_ref_slot(range, |slot| match slot.checked_sub(range.start) {
            Some(rel) if rel + word <= bytes.len() => bytes[rel..rel + word].iter().any(|&b| b != 0),
            _ => true,
        });
        match clobbered {
            Some(offset) => Err(RuntimeError::ReferenceOverlap {
                type_name: self.type_handle.name().to_string(),
                offset,
            }),
            None => Ok(()),
        }
    }

    /// First reference slot intersecting `range` that satisfies `pred`.
    fn find_ref_slot(
        &self,
        range: &Range<usize>,
        mut pred: impl FnMut(usize) -> bool,
    ) -> Option<usize> {
        let ty = self.type_handle;
        let slots = ty.gc_slots();
        if slots.is_empty() || range.is_empty() {
            return None;
        }
        let word = ObjectRef::SIZE;
        let intersects = |slot: usize| slot < range.end && range.start < slot + word;
        if !ty.is_array() {
            return slots.iter().copied().find(|&slot| intersects(slot) && pred(slot));
        }

        let base = ArrayLayoutManager::LENGTH_SIZE;
        if range.end <= base {
            return None;
        }
        let component = ty.component_size().max(1);
        let first = range.start.saturating_sub(base) / component;
        let last = (range.end - 1 - base) / component;
        (first..=last)
            .flat_map(move |i| slots.iter().map(move |slot| base + i * component + slot))
            .find(|&slot| intersects(slot) && pred(slot))
    }

    scalar_accessors! {
        read_i8, write_i8: i8;
        read_u8, write_u8: u8;
        read_i16, write_i16: i16;
        read_u16, write_u16: u16;
        read_i32, write_i32: i32;
        read_u32, write_u32: u32;
        read_i64, write_i64: i64;
        read_u64, write_u64: u64;
        read_isize, write_isize: isize;
        read_usize, write_usize: usize;
        read_f32, write_f32: f32;
        read_f64, write_f64: f64;
    }

    pub fn read_bool(&self, offset: ByteOffset) -> RuntimeResult<bool> {
        Ok(self.read_u8(offset)? != 0)
    }

    pub fn write_bool(&mut self, offset: ByteOffset, value: bool) -> RuntimeResult<()> {
        self.write_u8(offset, value as u8)
    }

    pub fn read_ref(&self, offset: ByteOffset) -> RuntimeResult<ObjectRef<'gc>> {
        self.check_ref_slot(offset)?;
        let range = self.range(offset, ObjectRef::SIZE)?;
        // SAFETY: declared reference slots are only written by write_ref or
        // cleared to null by raw writes
        Ok(unsafe { ObjectRef::read_unchecked(&self.storage[range]) })
    }

    /// Callers must have triggered the owning object's write barrier, which
    /// [`ObjectRef::with_payload_mut`] does.
    pub fn write_ref(&mut self, offset: ByteOffset, value: ObjectRef<'gc>) -> RuntimeResult<()> {
        self.check_ref_slot(offset)?;
        let range = self.range(offset, ObjectRef::SIZE)?;
        value.write(&mut self.storage[range]);
        Ok(())
    }

    /// Only slots the type declares as references may hold one, otherwise the
    /// collector would not see the pointer.
    fn check_ref_slot(&self, offset: ByteOffset) -> RuntimeResult<()> {
        let offset = offset.as_usize();
        let declared = if self.type_handle.is_array() {
            let component = self.type_handle.component_size().max(1);
            offset
                .checked_sub(ArrayLayoutManager::LENGTH_SIZE)
                .is_some_and(|rel| self.type_handle.gc_slots().contains(&(rel % component)))
        } else {
            self.type_handle.gc_slots().contains(&offset)
        };
        if declared {
            Ok(())
        } else {
            Err(RuntimeError::TypeMismatch {
                expected: "object reference slot".to_string(),
                actual: format!("offset {offset} of {}", self.type_handle),
            })
        }
    }

    /// Payload for a box holding the inline `ty` value at `offset`, references
    /// included.
    pub(crate) fn inline_value(&self, ty: TypeHandle, offset: ByteOffset) -> RuntimeResult<Self> {
        let range = self.range(offset, ty.value_size())?;
        let mut boxed = Self::zeroed(ty, ty.base_size() - HEADER_SIZE);
        boxed.storage[..range.len()].copy_from_slice(&self.storage[range]);
        Ok(boxed)
    }

    /// Element count of an array or string payload.
    pub fn array_length(&self) -> RuntimeResult<usize> {
        if !self.type_handle.has_component_size() {
            return Err(RuntimeError::TypeMismatch {
                expected: "array or string".to_string(),
                actual: self.type_handle.name().to_string(),
            });
        }
        self.read_usize(ByteOffset::ZERO)
    }

    pub fn element_offset(&self, index: usize) -> RuntimeResult<ByteOffset> {
        let length = self.array_length()?;
        if index >= length {
            return Err(RuntimeError::IndexOutOfRange { index, length });
        }
        Ok(ByteOffset(
            ArrayLayoutManager::LENGTH_SIZE + index * self.type_handle.component_size(),
        ))
    }

    /// Visits every object reference held in the payload.
    pub fn for_each_ref(&self, mut f: impl FnMut(ObjectRef<'gc>)) {
        let ty = self.type_handle;
        let slots = ty.gc_slots();
        if slots.is_empty() {
            return;
        }
        let word = ObjectRef::SIZE;
        // SAFETY: every offset visited below is a declared reference slot, see read_ref
        let read = |at: usize| unsafe { ObjectRef::read_unchecked(&self.storage[at..at + word]) };
        if ty.is_array() {
            let Ok(length) = self.read_usize(ByteOffset::ZERO) else {
                return;
            };
            let component = ty.component_size().max(1);
            let capacity = self.storage.len().saturating_sub(ArrayLayoutManager::LENGTH_SIZE) / component;
            for i in 0..length.min(capacity) {
                let base = ArrayLayoutManager::LENGTH_SIZE + i * component;
                for slot in slots {
                    let at = base + slot;
                    if at + word <= self.storage.len() {
                        f(read(at));
                    }
                }
            }
        } else {
            for &at in slots {
                if at + word <= self.storage.len() {
                    f(read(at));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{core_types, TypeBuilder};

    #[test]
    fn test_scalar_accessors_bounds_checked() {
        let pair = TypeBuilder::value_type("Tests.StoragePair")
            .field("a", core_types().int32)
            .field("b", core_types().int64)
            .build();
        let mut storage = FieldStorage::zeroed(pair, pair.value_size());
        storage.write_i32(ByteOffset(0), -7).unwrap();
        storage.write_i64(ByteOffset(8), 1 << 40).unwrap();
        assert_eq!(storage.read_i32(ByteOffset(0)).unwrap(), -7);
        assert_eq!(storage.read_i64(ByteOffset(8)).unwrap(), 1 << 40);

        let err = storage.read_i64(ByteOffset(12)).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfBounds { offset: 12, size: 8, .. }));
        assert!(storage.write_bytes(ByteOffset(usize::MAX), &[1]).is_err());
    }

    #[test]
    fn test_ref_slots_must_be_declared() {
        let holder = TypeBuilder::class("Tests.StorageHolder")
            .field("count", core_types().int64)
            .field("item", core_types().object)
            .build();
        let mut storage = FieldStorage::zeroed(holder, holder.value_size());
        assert!(storage.read_ref(ByteOffset(8)).unwrap().is_null());
        assert!(matches!(
            storage.write_ref(ByteOffset(0), ObjectRef::NULL),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_raw_writes_cannot_fill_reference_slots() {
        let holder = TypeBuilder::class("Tests.StorageRawHolder")
            .field("count", core_types().int64)
            .field("item", core_types().object)
            .build();
        let item = holder.field("item").unwrap().position;
        let mut storage = FieldStorage::zeroed(holder, holder.value_size());

        let overlap = RuntimeError::ReferenceOverlap {
            type_name: "Tests.StorageRawHolder".to_string(),
            offset: item,
        };
        assert_eq!(storage.write_usize(ByteOffset(item), 0x4141_4141), Err(overlap.clone()));
        assert_eq!(storage.write_u16(ByteOffset(item + 1), 0), Err(overlap.clone()));
        let filled = vec![0xff; storage.len()];
        assert_eq!(storage.write_bytes(ByteOffset::ZERO, &filled), Err(overlap));
        assert!(storage.read_ref(ByteOffset(item)).unwrap().is_null());

        storage.write_usize(ByteOffset(item), 0).unwrap();
        let mut bytes = vec![0; storage.len()];
        bytes[..8].copy_from_slice(&9i64.to_ne_bytes());
        storage.write_bytes(ByteOffset::ZERO, &bytes).unwrap();
        assert_eq!(storage.read_i64(ByteOffset::ZERO).unwrap(), 9);
    }

    #[test]
    fn test_raw_writes_cannot_fill_array_elements() {
        let word = ObjectRef::SIZE;
        let objects = TypeBuilder::array_of(core_types().object);
        let mut storage =
            FieldStorage::zeroed(objects, ArrayLayoutManager::LENGTH_SIZE + 2 * word);
        storage.write_usize(ByteOffset::ZERO, 2).unwrap();

        let second = ArrayLayoutManager::LENGTH_SIZE + word;
        assert!(matches!(
            storage.write_u8(ByteOffset(second + 3), 1),
            Err(RuntimeError::ReferenceOverlap { offset, .. }) if offset == second
        ));
        let mut refs = 0;
        storage.for_each_ref(|r| {
            assert!(r.is_null());
            refs += 1;
        });
        assert_eq!(refs, 2);
    }

    #[test]
    fn test_array_length_requires_component_type() {
        let storage = FieldStorage::zeroed(core_types().int32, 4);
        assert!(storage.array_length().is_err());

        let ints = TypeBuilder::array_of(core_types().int32);
        let mut storage = FieldStorage::zeroed(ints, ArrayLayoutManager::LENGTH_SIZE + 12);
        storage.write_usize(ByteOffset::ZERO, 3).unwrap();
        assert_eq!(storage.array_length().unwrap(), 3);
        assert_eq!(
            storage.element_offset(2).unwrap(),
            ByteOffset(ArrayLayoutManager::LENGTH_SIZE + 8)
        );
        assert!(matches!(
            storage.element_offset(3),
            Err(RuntimeError::IndexOutOfRange { index: 3, length: 3 })
        ));
    }
}
