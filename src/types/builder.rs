use super::{
    core_types, CtorFn, EEType, EETypeFlags, EETypeKind, ElementType, EqualsFn, FinalizerFn,
    HashCodeFn, TypeHandle, TypeMethods,
};
use crate::{
    error::{RuntimeError, RuntimeResult},
    utils::align_up,
    value::{
        layout::{ArrayLayoutManager, FieldLayoutManager, HasLayout, LayoutManager, Scalar},
        HEADER_SIZE,
    },
};
use tracing::trace;

const WORD: usize = size_of::<usize>();
const SZARRAY_SHAPE: u32 = 1;

enum FieldSpec {
    Sequential(Vec<(Box<str>, TypeHandle)>),
    Explicit {
        fields: Vec<(Box<str>, usize, TypeHandle)>,
        class_size: Option<usize>,
    },
}

/// Builds type descriptors. Every call to [`TypeBuilder::build`] produces a
/// new descriptor, even for a name that was built before.
pub struct TypeBuilder {
    name: String,
    flags: EETypeFlags,
    element_type: ElementType,
    base: Option<TypeHandle>,
    fields: FieldSpec,
    scalar: Option<Scalar>,
    methods: TypeMethods,
}

impl TypeBuilder {
    fn new(name: impl Into<String>, flags: EETypeFlags, element_type: ElementType) -> Self {
        Self {
            name: name.into(),
            flags,
            element_type,
            base: None,
            fields: FieldSpec::Sequential(vec![]),
            scalar: None,
            methods: TypeMethods::default(),
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::new(name, EETypeFlags::empty(), ElementType::Class)
    }

    pub fn value_type(name: impl Into<String>) -> Self {
        Self::new(name, EETypeFlags::VALUE_TYPE, ElementType::ValueType)
    }

    pub fn interface(name: impl Into<String>) -> Self {
        let mut builder = Self::new(
            name,
            EETypeFlags::IS_INTERFACE | EETypeFlags::IS_ABSTRACT,
            ElementType::Class,
        );
        builder.base = Some(TypeHandle::NULL);
        builder
    }

    /// An enum stores exactly one value of its primitive underlying type.
    pub fn enum_type(name: impl Into<String>, underlying: TypeHandle) -> Self {
        let mut builder = Self::new(
            name,
            EETypeFlags::VALUE_TYPE | EETypeFlags::IS_ENUM,
            underlying.element_type(),
        );
        builder.scalar = Scalar::for_element_type(underlying.element_type());
        builder
    }

    pub(crate) fn primitive(name: &str, element_type: ElementType) -> Self {
        let mut builder = Self::new(
            name,
            EETypeFlags::VALUE_TYPE | EETypeFlags::IS_PRIMITIVE,
            element_type,
        );
        builder.scalar = Scalar::for_element_type(element_type);
        builder
    }

    pub fn base(mut self, base: TypeHandle) -> Self {
        self.base = Some(base);
        self
    }

    pub fn field(mut self, name: &str, field_type: TypeHandle) -> Self {
        match &mut self.fields {
            FieldSpec::Sequential(fields) => fields.push((name.into(), field_type)),
            FieldSpec::Explicit { fields, .. } => {
                let offset = fields
                    .iter()
                    .map(|(_, o, t)| o + t.inline_size())
                    .max()
                    .unwrap_or(0);
                fields.push((name.into(), offset, field_type))
            }
        }
        self
    }

    /// Switches to explicit layout; every field placed so far keeps its
    /// declaration order but must be re-added through this method.
    pub fn explicit_field(mut self, name: &str, offset: usize, field_type: TypeHandle) -> Self {
        if let FieldSpec::Sequential(_) = self.fields {
            self.fields = FieldSpec::Explicit {
                fields: vec![],
                class_size: None,
            };
        }
        if let FieldSpec::Explicit { fields, .. } = &mut self.fields {
            fields.push((name.into(), offset, field_type));
        }
        self
    }

    pub fn class_size(mut self, size: usize) -> Self {
        if let FieldSpec::Explicit { class_size, .. } = &mut self.fields {
            *class_size = Some(size);
        }
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.flags |= EETypeFlags::IS_ABSTRACT;
        self
    }

    pub fn generic(mut self) -> Self {
        self.flags |= EETypeFlags::IS_GENERIC;
        self
    }

    pub fn equals(mut self, f: EqualsFn) -> Self {
        self.methods.equals = Some(f);
        self
    }

    pub fn hash_code(mut self, f: HashCodeFn) -> Self {
        self.methods.hash_code = Some(f);
        self
    }

    pub fn default_ctor(mut self, f: CtorFn) -> Self {
        self.methods.default_ctor = Some(f);
        self
    }

    pub fn finalizer(mut self, f: FinalizerFn) -> Self {
        self.methods.finalizer = Some(f);
        self
    }

    pub(crate) fn string_type(mut self) -> Self {
        self.flags |= EETypeFlags::IS_STRING;
        self.element_type = ElementType::String;
        self
    }

    /// # Panics
    ///
    /// Panics where [`TypeBuilder::try_build`] would return an error.
    pub fn build(self) -> TypeHandle {
        match self.try_build() {
            Ok(handle) => handle,
            Err(e) => panic!("{e}"),
        }
    }

    /// Fails with [`RuntimeError::ReferenceOverlap`] when an explicit layout
    /// puts other data over an object reference.
    pub fn try_build(self) -> RuntimeResult<TypeHandle> {
        let is_value_type = self.flags.contains(EETypeFlags::VALUE_TYPE);
        let base = match self.base {
            Some(b) => b,
            None if self.flags.contains(EETypeFlags::IS_ENUM) => core_types().enum_type,
            None if is_value_type => core_types().value_type,
            None => core_types().object,
        };

        let mut flags = self.flags | EETypeFlags::RUNTIME_ALLOCATED;

        let mut methods = self.methods;
        if !base.is_null() {
            let inherited = base.methods();
            methods.equals = methods.equals.or(inherited.equals);
            methods.hash_code = methods.hash_code.or(inherited.hash_code);
            methods.finalizer = methods.finalizer.or(inherited.finalizer);
        }
        if methods.finalizer.is_some() {
            flags |= EETypeFlags::HAS_FINALIZER;
        }

        let layout: LayoutManager = if flags.contains(EETypeFlags::IS_STRING) {
            ArrayLayoutManager::new(Scalar::Int16.into()).into()
        } else if let Some(scalar) = self.scalar {
            scalar.into()
        } else {
            let inherited = if base.is_null() || is_value_type {
                None
            } else {
                match base.layout() {
                    LayoutManager::FieldLayoutManager(f) => Some(f),
                    _ => None,
                }
            };
            match self.fields {
                FieldSpec::Sequential(fields) => {
                    FieldLayoutManager::sequential(inherited, fields).into()
                }
                FieldSpec::Explicit { fields, class_size } => {
                    let layout = FieldLayoutManager::explicit(fields, class_size);
                    if let Some(offset) = layout.reference_overlap() {
                        return Err(RuntimeError::ReferenceOverlap {
                            type_name: self.name,
                            offset,
                        });
                    }
                    layout.into()
                }
            }
        };

        let mut gc_slots = vec![];
        layout.gc_slots(0, &mut gc_slots);
        if !gc_slots.is_empty() {
            flags |= EETypeFlags::HAS_POINTERS;
        }

        let (value_size, component_size) = if flags.contains(EETypeFlags::IS_STRING) {
            (ArrayLayoutManager::LENGTH_SIZE, 2)
        } else {
            (layout.size(), 0)
        };

        let special_fields = match &layout {
            LayoutManager::FieldLayoutManager(f) => f
                .fields
                .iter()
                .filter(|f| needs_special_equality(f.field_type))
                .count() as u16,
            _ => 0,
        };

        let descriptor = EEType {
            hash: name_hash(&self.name),
            name: self.name.into_boxed_str(),
            kind: EETypeKind::Canonical,
            flags,
            element_type: self.element_type,
            base_size: (HEADER_SIZE + align_up(value_size, WORD)) as u32,
            component_size,
            value_size: value_size as u32,
            base_type: base,
            related_type: TypeHandle::NULL,
            shape: 0,
            layout,
            gc_slots: gc_slots.into_boxed_slice(),
            special_fields,
            methods,
        };
        Ok(publish(descriptor))
    }

    /// Single-dimensional, zero-based array of `element`.
    pub fn array_of(element: TypeHandle) -> TypeHandle {
        let mut gc_slots = vec![];
        if element.is_value_type() {
            gc_slots.extend_from_slice(element.gc_slots());
        } else if !element.is_pointer() {
            gc_slots.push(0);
        }

        let mut flags = EETypeFlags::RUNTIME_ALLOCATED;
        if !gc_slots.is_empty() {
            flags |= EETypeFlags::HAS_POINTERS;
        }

        let descriptor = EEType {
            name: format!("{}[]", element.name()).into_boxed_str(),
            kind: EETypeKind::Parameterized,
            flags,
            element_type: ElementType::SzArray,
            base_size: (HEADER_SIZE + ArrayLayoutManager::LENGTH_SIZE) as u32,
            component_size: element.inline_size() as u16,
            value_size: ArrayLayoutManager::LENGTH_SIZE as u32,
            base_type: core_types().array,
            related_type: element,
            shape: SZARRAY_SHAPE,
            layout: ArrayLayoutManager::new(element.field_layout()).into(),
            gc_slots: gc_slots.into_boxed_slice(),
            hash: parameterized_hash(element.hash_code() as u32, SZARRAY_SHAPE),
            special_fields: 0,
            methods: TypeMethods::default(),
        };
        publish(descriptor)
    }

    /// Unmanaged pointer to `element`.
    pub fn pointer_to(element: TypeHandle) -> TypeHandle {
        let descriptor = EEType {
            name: format!("{}*", element.name()).into_boxed_str(),
            kind: EETypeKind::Parameterized,
            flags: EETypeFlags::RUNTIME_ALLOCATED,
            element_type: ElementType::Ptr,
            base_size: (HEADER_SIZE + WORD) as u32,
            component_size: 0,
            value_size: WORD as u32,
            base_type: TypeHandle::NULL,
            related_type: element,
            shape: 0,
            layout: Scalar::NativeInt.into(),
            gc_slots: Box::new([]),
            hash: parameterized_hash(element.hash_code() as u32, 0),
            special_fields: 0,
            methods: TypeMethods::default(),
        };
        publish(descriptor)
    }

    /// A second, distinct descriptor for `canonical`'s type.
    pub fn clone_of(canonical: TypeHandle) -> TypeHandle {
        let source = canonical.canonical().descriptor();
        let mut descriptor = source.clone();
        descriptor.kind = EETypeKind::Cloned;
        descriptor.related_type = TypeHandle::from_static(source);
        publish(descriptor)
    }
}

fn publish(descriptor: EEType) -> TypeHandle {
    let leaked: &'static EEType = Box::leak(Box::new(descriptor));
    trace!(name = %leaked.name, kind = ?leaked.kind, "built type descriptor");
    TypeHandle::from_static(leaked)
}

/// Fields that cannot be compared by their raw bytes: references, floating
/// point values and value types that are themselves not bytewise comparable.
fn needs_special_equality(field_type: TypeHandle) -> bool {
    if field_type.is_pointer() {
        return false;
    }
    if !field_type.is_value_type() {
        return true;
    }
    if field_type.is_primitive() {
        return field_type.element_type().is_floating_point();
    }
    if field_type.is_enum() {
        return false;
    }
    field_type.special_field_count() > 0 || field_type.methods().equals.is_some()
}

fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn parameterized_hash(element_hash: u32, shape: u32) -> u32 {
    element_hash.rotate_left(7) ^ shape.wrapping_add(0x9e37_79b9).wrapping_mul(0x85eb_ca6b)
}
