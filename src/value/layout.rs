use crate::{
    types::{ElementType, TypeHandle},
    utils::align_up,
};
use enum_dispatch::enum_dispatch;
use std::{mem::size_of, ops::Range};

#[enum_dispatch]
pub trait HasLayout {
    fn size(&self) -> usize;
    fn alignment(&self) -> usize;
}

#[enum_dispatch(HasLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutManager {
    FieldLayoutManager,
    ArrayLayoutManager,
    Scalar,
}

impl LayoutManager {
    /// Appends the offset of every object reference slot, relative to `base`.
    /// Array elements are not included; their slots repeat per element.
    pub fn gc_slots(&self, base: usize, out: &mut Vec<usize>) {
        match self {
            LayoutManager::FieldLayoutManager(f) => {
                for field in &f.fields {
                    field.layout.gc_slots(base + field.position, out);
                }
            }
            LayoutManager::ArrayLayoutManager(_) => {}
            LayoutManager::Scalar(Scalar::ObjectRef) => out.push(base),
            LayoutManager::Scalar(_) => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub name: Box<str>,
    pub position: usize,
    pub field_type: TypeHandle,
    pub layout: LayoutManager,
}

impl FieldLayout {
    pub fn as_range(&self) -> Range<usize> {
        self.position..self.position + self.layout.size()
    }
}

/// Instance fields in declaration order, base type fields first.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldLayoutManager {
    pub fields: Vec<FieldLayout>,
    pub total_size: usize,
}

impl HasLayout for FieldLayoutManager {
    fn size(&self) -> usize {
        self.total_size
    }

    fn alignment(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.layout.alignment())
            .max()
            .unwrap_or(1)
    }
}

impl FieldLayoutManager {
    /// Lays fields out one after another at their natural alignment, starting
    /// after `inherited` (the base type's fields).
    pub fn sequential(
        inherited: Option<&FieldLayoutManager>,
        fields: impl IntoIterator<Item = (Box<str>, TypeHandle)>,
    ) -> Self {
        let mut mapping: Vec<FieldLayout> =
            inherited.map(|b| b.fields.clone()).unwrap_or_default();
        let mut offset = inherited.map_or(0, |b| b.total_size);

        for (name, field_type) in fields {
            let layout = field_type.field_layout();
            let position = align_up(offset, layout.alignment());
            offset = position + layout.size();
            mapping.push(FieldLayout {
                name,
                position,
                field_type,
                layout,
            });
        }

        let mut result = Self {
            fields: mapping,
            total_size: offset,
        };
        result.total_size = align_up(offset, result.alignment());
        result
    }

    /// Places every field at a caller-chosen offset. Fields may overlap, but
    /// see [`FieldLayoutManager::reference_overlap`].
    pub fn explicit(
        fields: impl IntoIterator<Item = (Box<str>, usize, TypeHandle)>,
        class_size: Option<usize>,
    ) -> Self {
        let mut mapping = vec![];
        for (name, position, field_type) in fields {
            mapping.push(FieldLayout {
                name,
                position,
                layout: field_type.field_layout(),
                field_type,
            });
        }
        let total_size = match class_size {
            Some(size) => size,
            None => mapping.iter().map(|f| f.as_range().end).max().unwrap_or(0),
        };
        Self {
            fields: mapping,
            total_size,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// The first object reference slot that another field partially or fully
    /// overlaps with non-reference data. Two references sharing one slot are fine.
    pub fn reference_overlap(&self) -> Option<usize> {
        let word = size_of::<usize>();
        let slots: Vec<Vec<usize>> = self
            .fields
            .iter()
            .map(|f| {
                let mut out = vec![];
                f.layout.gc_slots(f.position, &mut out);
                out
            })
            .collect();

        for (i, own) in slots.iter().enumerate() {
            for &slot in own {
                let conflict = self.fields.iter().enumerate().any(|(j, other)| {
                    let range = other.as_range();
                    j != i
                        && range.start < slot + word
                        && slot < range.end
                        && !slots[j].contains(&slot)
                });
                if conflict {
                    return Some(slot);
                }
            }
        }
        None
    }
}

/// Payload shape of arrays and strings: a length word followed by elements.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayLayoutManager {
    pub element_layout: Box<LayoutManager>,
}

impl HasLayout for ArrayLayoutManager {
    fn size(&self) -> usize {
        Self::LENGTH_SIZE
    }

    fn alignment(&self) -> usize {
        size_of::<usize>()
    }
}

impl ArrayLayoutManager {
    pub const LENGTH_SIZE: usize = size_of::<usize>();

    pub fn new(element: LayoutManager) -> Self {
        Self {
            element_layout: Box::new(element),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scalar {
    ObjectRef,
    Int8,
    Int16,
    Int32,
    Int64,
    NativeInt,
    Float32,
    Float64,
}

impl HasLayout for Scalar {
    fn size(&self) -> usize {
        match self {
            Scalar::Int8 => 1,
            Scalar::Int16 => 2,
            Scalar::Int32 => 4,
            Scalar::Int64 => 8,
            Scalar::ObjectRef | Scalar::NativeInt => size_of::<usize>(),
            Scalar::Float32 => 4,
            Scalar::Float64 => 8,
        }
    }

    fn alignment(&self) -> usize {
        self.size()
    }
}

impl Scalar {
    pub fn for_element_type(element: ElementType) -> Option<Self> {
        Some(match element {
            ElementType::Boolean | ElementType::I1 | ElementType::U1 => Scalar::Int8,
            ElementType::Char | ElementType::I2 | ElementType::U2 => Scalar::Int16,
            ElementType::I4 | ElementType::U4 => Scalar::Int32,
            ElementType::I8 | ElementType::U8 => Scalar::Int64,
            ElementType::I | ElementType::U | ElementType::Ptr => Scalar::NativeInt,
            ElementType::R4 => Scalar::Float32,
            ElementType::R8 => Scalar::Float64,
            ElementType::Class
            | ElementType::Object
            | ElementType::String
            | ElementType::SzArray
            | ElementType::Array => Scalar::ObjectRef,
            ElementType::Unknown | ElementType::Void | ElementType::ValueType => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{core_types, TypeBuilder};

    #[test]
    fn test_sequential_layout_aligns_fields() {
        let core = core_types();
        let layout = FieldLayoutManager::sequential(
            None,
            [
                ("a".into(), core.byte),
                ("b".into(), core.int32),
                ("c".into(), core.int16),
            ],
        );
        let positions: Vec<_> = layout.fields.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![0, 4, 8]);
        assert_eq!(layout.total_size, 12);
        assert_eq!(layout.alignment(), 4);
    }

    #[test]
    fn test_inherited_fields_come_first() {
        let core = core_types();
        let base = FieldLayoutManager::sequential(None, [("x".into(), core.int64)]);
        let derived = FieldLayoutManager::sequential(Some(&base), [("y".into(), core.int32)]);
        assert_eq!(derived.field("x").map(|f| f.position), Some(0));
        assert_eq!(derived.field("y").map(|f| f.position), Some(8));
        assert_eq!(derived.total_size, 16);
    }

    #[test]
    fn test_gc_slots_include_nested_structs() {
        let core = core_types();
        let inner = TypeBuilder::value_type("Tests.LayoutInner")
            .field("n", core.int32)
            .field("s", core.string)
            .build();
        let layout = FieldLayoutManager::sequential(
            None,
            [("head".into(), core.object), ("body".into(), inner)],
        );
        let mut slots = vec![];
        LayoutManager::from(layout).gc_slots(0, &mut slots);
        let word = size_of::<usize>();
        assert_eq!(slots, vec![0, word + word]);
    }

    #[test]
    fn test_explicit_layout_uses_class_size() {
        let core = core_types();
        let layout = FieldLayoutManager::explicit(
            [("lo".into(), 0, core.int32), ("all".into(), 0, core.int64)],
            None,
        );
        assert_eq!(layout.total_size, 8);
        let padded = FieldLayoutManager::explicit([("lo".into(), 0, core.int32)], Some(16));
        assert_eq!(padded.size(), 16);
        assert_eq!(layout.reference_overlap(), None);
    }

    #[test]
    fn test_explicit_reference_overlap() {
        let core = core_types();
        let word = size_of::<usize>();
        let shared = FieldLayoutManager::explicit(
            [("a".into(), 0, core.object), ("b".into(), 0, core.string)],
            None,
        );
        assert_eq!(shared.reference_overlap(), None);

        let punned = FieldLayoutManager::explicit(
            [("count".into(), 0, core.int64), ("name".into(), 0, core.string)],
            None,
        );
        assert_eq!(punned.reference_overlap(), Some(0));

        let straddling = FieldLayoutManager::explicit(
            [("head".into(), word, core.object), ("tail".into(), word + 2, core.int32)],
            None,
        );
        assert_eq!(straddling.reference_overlap(), Some(word));

        let inner = TypeBuilder::value_type("Tests.LayoutOverlapInner")
            .field("n", core.int32)
            .field("s", core.string)
            .build();
        let nested = FieldLayoutManager::explicit(
            [("body".into(), 0, inner), ("raw".into(), word, core.int64)],
            None,
        );
        assert_eq!(nested.reference_overlap(), Some(word));
    }
}
