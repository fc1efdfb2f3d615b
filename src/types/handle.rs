use super::{EEType, EETypeFlags, EETypeKind, ElementType, TypeMethods};
use crate::{
    error::{RuntimeError, RuntimeResult},
    utils::ByteOffset,
    value::layout::{FieldLayout, LayoutManager, Scalar},
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
};

/// Opaque pointer to a type descriptor.
///
/// The runtime does not unify descriptors: one logical type may be reachable
/// through several distinct handles (cloned descriptors, separately built
/// array or pointer types). Comparison therefore goes through
/// [`TypeHandle::equals`], never through the raw pointer.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct TypeHandle(Option<&'static EEType>);

const _: () = assert!(size_of::<TypeHandle>() == size_of::<usize>());

impl TypeHandle {
    pub const NULL: Self = Self(None);

    pub(crate) fn from_static(descriptor: &'static EEType) -> Self {
        Self(Some(descriptor))
    }

    pub const fn is_null(self) -> bool {
        self.0.is_none()
    }

    /// Raw identifier, as stored in object headers and dumps.
    pub fn as_raw(self) -> usize {
        match self.0 {
            Some(d) => d as *const EEType as usize,
            None => 0,
        }
    }

    pub fn try_descriptor(self) -> RuntimeResult<&'static EEType> {
        self.0.ok_or(RuntimeError::NullTypeHandle)
    }

    pub fn descriptor(self) -> &'static EEType {
        match self.0 {
            Some(d) => d,
            None => panic!("called TypeHandle::descriptor on NULL type handle"),
        }
    }

    /// Null equals only null; otherwise structural equivalence.
    pub fn equals(self, other: TypeHandle) -> bool {
        match (self.0, other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => are_types_equivalent(a, b),
            _ => false,
        }
    }

    /// Raw comparison first, structural check only on mismatch.
    /// Callers guarantee neither handle is null.
    #[inline]
    pub fn fast_equals(self, other: TypeHandle) -> bool {
        debug_assert!(!self.is_null() && !other.is_null());
        self.as_raw() == other.as_raw() || self.equals(other)
    }

    /// Equal handles always produce equal hash codes.
    pub fn hash_code(self) -> i32 {
        self.0.map_or(0, |d| d.hash as i32)
    }

    pub fn name(self) -> &'static str {
        self.0.map_or("<null>", |d| &d.name)
    }

    pub fn kind(self) -> EETypeKind {
        self.descriptor().kind
    }

    pub fn flags(self) -> EETypeFlags {
        self.descriptor().flags
    }

    pub fn element_type(self) -> ElementType {
        self.descriptor().element_type
    }

    /// Strips cloning; parameterized and canonical handles are returned as is.
    pub fn canonical(self) -> TypeHandle {
        match self.0 {
            Some(d) => TypeHandle(Some(canonical_of(d))),
            None => self,
        }
    }

    pub fn is_array(self) -> bool {
        let d = self.descriptor();
        d.kind == EETypeKind::Parameterized && d.shape > 0
    }

    pub fn is_sz_array(self) -> bool {
        self.element_type() == ElementType::SzArray
    }

    pub fn is_pointer(self) -> bool {
        let d = self.descriptor();
        d.kind == EETypeKind::Parameterized && d.shape == 0
    }

    pub fn is_value_type(self) -> bool {
        self.flags().contains(EETypeFlags::VALUE_TYPE)
    }

    pub fn is_string(self) -> bool {
        self.flags().contains(EETypeFlags::IS_STRING)
    }

    pub fn is_primitive(self) -> bool {
        self.flags().contains(EETypeFlags::IS_PRIMITIVE)
    }

    pub fn is_enum(self) -> bool {
        self.flags().contains(EETypeFlags::IS_ENUM)
    }

    pub fn is_interface(self) -> bool {
        self.flags().contains(EETypeFlags::IS_INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.flags()
            .intersects(EETypeFlags::IS_ABSTRACT | EETypeFlags::IS_INTERFACE)
    }

    pub fn has_pointers(self) -> bool {
        self.flags().contains(EETypeFlags::HAS_POINTERS)
    }

    pub fn has_finalizer(self) -> bool {
        self.flags().contains(EETypeFlags::HAS_FINALIZER)
    }

    pub fn has_component_size(self) -> bool {
        self.descriptor().component_size != 0
    }

    pub fn component_size(self) -> usize {
        self.descriptor().component_size as usize
    }

    pub fn base_size(self) -> usize {
        self.descriptor().base_size as usize
    }

    pub fn value_size(self) -> usize {
        self.descriptor().value_size as usize
    }

    pub fn base_type(self) -> TypeHandle {
        self.descriptor().base_type
    }

    /// Element type of an array or pointer, canonical type of a clone.
    pub fn related_type(self) -> TypeHandle {
        self.descriptor().related_type
    }

    pub fn array_rank(self) -> u32 {
        if self.is_array() {
            self.descriptor().shape
        } else {
            0
        }
    }

    pub fn layout(self) -> &'static LayoutManager {
        &self.descriptor().layout
    }

    /// Offsets of object references within one instance payload, or within
    /// one element for arrays.
    pub fn gc_slots(self) -> &'static [usize] {
        &self.descriptor().gc_slots
    }

    pub fn methods(self) -> &'static TypeMethods {
        &self.descriptor().methods
    }

    /// Instance fields in declaration order, base type fields first.
    pub fn fields(self) -> &'static [FieldLayout] {
        match &self.descriptor().layout {
            LayoutManager::FieldLayoutManager(f) => &f.fields,
            _ => &[],
        }
    }

    pub fn field(self, name: &str) -> Option<&'static FieldLayout> {
        self.fields().iter().find(|f| &*f.name == name)
    }

    /// Number of fields whose equality cannot be decided by comparing bytes.
    pub fn special_field_count(self) -> usize {
        self.descriptor().special_fields as usize
    }

    /// The (offset, type) pairs field-wise equality walks. Empty when the
    /// type can be compared bytewise.
    pub fn equatable_fields(self) -> impl Iterator<Item = (ByteOffset, TypeHandle)> {
        let fields = if self.special_field_count() == 0 {
            &[][..]
        } else {
            self.fields()
        };
        fields
            .iter()
            .map(|f| (ByteOffset(f.position), f.field_type))
    }

    /// Layout used when a value of this type is stored in a field or array slot.
    pub fn field_layout(self) -> LayoutManager {
        if self.is_value_type() {
            self.descriptor().layout.clone()
        } else if self.is_pointer() {
            Scalar::NativeInt.into()
        } else {
            Scalar::ObjectRef.into()
        }
    }

    /// Bytes a value of this type occupies inline in a field or array slot.
    pub fn inline_size(self) -> usize {
        if self.is_value_type() {
            self.value_size()
        } else {
            size_of::<usize>()
        }
    }

    pub fn is_subclass_of(self, ancestor: TypeHandle) -> bool {
        let mut current = self.base_type();
        while !current.is_null() {
            if current.equals(ancestor) {
                return true;
            }
            current = current.base_type();
        }
        false
    }
}

fn canonical_of(mut d: &'static EEType) -> &'static EEType {
    while d.kind == EETypeKind::Cloned {
        match d.related_type.0 {
            Some(r) => d = r,
            None => break,
        }
    }
    d
}

/// Descriptor equivalence: identity, then canonical identity, then matching
/// shapes over equivalent related types. Iterative so nesting depth cannot
/// overflow the stack.
fn are_types_equivalent(mut a: &'static EEType, mut b: &'static EEType) -> bool {
    loop {
        if std::ptr::eq(a, b) {
            return true;
        }
        a = canonical_of(a);
        b = canonical_of(b);
        if std::ptr::eq(a, b) {
            return true;
        }
        if a.kind != EETypeKind::Parameterized || b.kind != EETypeKind::Parameterized {
            return false;
        }
        if a.shape != b.shape {
            return false;
        }
        match (a.related_type.0, b.related_type.0) {
            (Some(ra), Some(rb)) => {
                a = ra;
                b = rb;
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.equals(*other)
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_code().hash(state);
    }
}

impl Debug for TypeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => write!(f, "NULL"),
            Some(d) => write!(f, "{} @ {:#x}", d.name, self.as_raw()),
        }
    }
}

impl Display for TypeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
