//! Type metadata for managed objects.
//!
//! Every managed object and array records a [`TypeId`] in its header. The
//! table maps that id to a [`TypeDescriptor`] describing the instance size
//! and the field layout, which is what the collector walks to find the
//! references an object owns. Inherited fields are found by following the
//! descriptor's parent link.

use std::fmt;

use parking_lot::RwLock;

use crate::{align_usize, globals::REFERENCE_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TypeId(u32);

impl TypeId {
    /// Sentinel carried by strings, which have no descriptor.
    pub const NONE: TypeId = TypeId(0);

    pub const fn index(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_index(index: u32) -> Self {
        Self(index)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldKind {
    /// Plain data, ignored by the collector.
    Value,
    /// Raw address, ignored by the collector.
    Pointer,
    /// Managed reference, owns one count on its target.
    Reference,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub kind: FieldKind,
}

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    pub name: String,
    /// Instance size in bytes, inherited fields included.
    pub size: usize,
    pub is_value_type: bool,
    /// Fields declared by this type. Offsets are from the start of the payload.
    pub fields: Vec<FieldDescriptor>,
    pub parent: Option<TypeId>,
}

impl TypeDescriptor {
    pub fn class(name: impl Into<String>) -> TypeBuilder {
        TypeBuilder {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
        }
    }

    /// A value type of `size` bytes, used as an array element type.
    pub fn value_type(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            is_value_type: true,
            fields: Vec::new(),
            parent: None,
        }
    }
}

/// Lays out a class field by field.
#[derive(Clone, Debug)]
pub struct TypeBuilder {
    name: String,
    parent: Option<TypeId>,
    fields: Vec<(String, usize, FieldKind)>,
}

impl TypeBuilder {
    pub fn extends(mut self, parent: TypeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn reference(mut self, name: impl Into<String>) -> Self {
        self.fields
            .push((name.into(), REFERENCE_SIZE, FieldKind::Reference));
        self
    }

    pub fn pointer(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), REFERENCE_SIZE, FieldKind::Pointer));
        self
    }

    pub fn value(mut self, name: impl Into<String>, size: usize) -> Self {
        self.fields.push((name.into(), size, FieldKind::Value));
        self
    }

    fn layout(self, base: usize) -> TypeDescriptor {
        let mut cursor = base;
        let fields = self
            .fields
            .into_iter()
            .map(|(name, size, kind)| {
                let align = size.max(1).next_power_of_two().min(REFERENCE_SIZE);
                let offset = align_usize(cursor, align);
                cursor = offset + size;
                FieldDescriptor {
                    name,
                    offset,
                    size,
                    kind,
                }
            })
            .collect();
        TypeDescriptor {
            name: self.name,
            size: align_usize(cursor, REFERENCE_SIZE),
            is_value_type: false,
            fields,
            parent: self.parent,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TypeError {
    UnknownParent(TypeId),
    ValueTypeParent(TypeId),
    FieldOutOfBounds { type_name: String, field: String },
    /// Class instance smaller than its parent or not a multiple of the reference size.
    BadInstanceSize { type_name: String, size: usize },
    /// Reference or pointer field that is not one reference wide at an aligned offset.
    MisalignedField { type_name: String, field: String },
    TableFull,
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownParent(id) => write!(f, "unknown parent type {}", id.index()),
            Self::ValueTypeParent(id) => write!(f, "value type {} cannot be a parent", id.index()),
            Self::FieldOutOfBounds { type_name, field } => {
                write!(f, "field {}.{} lies outside the instance", type_name, field)
            }
            Self::BadInstanceSize { type_name, size } => {
                write!(f, "instance size {} of {} is invalid", size, type_name)
            }
            Self::MisalignedField { type_name, field } => {
                write!(f, "reference field {}.{} is misaligned", type_name, field)
            }
            Self::TableFull => write!(f, "type table exhausted"),
        }
    }
}

impl std::error::Error for TypeError {}

pub struct TypeTable {
    types: RwLock<Vec<TypeDescriptor>>,
}

impl TypeTable {
    /// At most [`MAX_INDEX - 1`](TypeTable::MAX_INDEX) types can be registered.
    pub const MAX_INDEX: u32 = 1 << 14;
    /// Smallest id handed out; [`TypeId::NONE`] is reserved.
    pub const MIN_INDEX: u32 = 1;

    pub fn new() -> Self {
        Self {
            types: RwLock::new(vec![TypeDescriptor::value_type("<none>", 0)]),
        }
    }

    /// Lay out `builder` after its parent's fields and register it.
    pub fn define(&self, builder: TypeBuilder) -> Result<TypeId, TypeError> {
        let base = match builder.parent {
            Some(parent) => self.parent_size(parent)?,
            None => 0,
        };
        self.register(builder.layout(base))
    }

    /// Register a laid out descriptor.
    ///
    /// A class instance must cover its parent's instance and be a whole number
    /// of references; reference and pointer fields must be reference sized and
    /// reference aligned.
    pub fn register(&self, descriptor: TypeDescriptor) -> Result<TypeId, TypeError> {
        let parent_size = match descriptor.parent {
            Some(parent) => self.parent_size(parent)?,
            None => 0,
        };
        if !descriptor.is_value_type
            && (descriptor.size < parent_size || descriptor.size % REFERENCE_SIZE != 0)
        {
            return Err(TypeError::BadInstanceSize {
                type_name: descriptor.name.clone(),
                size: descriptor.size,
            });
        }
        if let Some(field) = descriptor.fields.iter().find(|field| {
            field.kind != FieldKind::Value
                && (field.size != REFERENCE_SIZE || field.offset % REFERENCE_SIZE != 0)
        }) {
            return Err(TypeError::MisalignedField {
                type_name: descriptor.name.clone(),
                field: field.name.clone(),
            });
        }
        if let Some(field) = descriptor
            .fields
            .iter()
            .find(|field| field.offset + field.size > descriptor.size)
        {
            return Err(TypeError::FieldOutOfBounds {
                type_name: descriptor.name.clone(),
                field: field.name.clone(),
            });
        }

        let mut types = self.types.write();
        let index = types.len() as u32;
        if index >= Self::MAX_INDEX {
            return Err(TypeError::TableFull);
        }
        log::trace!("type {} registered as {}", descriptor.name, index);
        types.push(descriptor);
        Ok(TypeId(index))
    }

    fn parent_size(&self, parent: TypeId) -> Result<usize, TypeError> {
        let types = self.types.read();
        match Self::lookup(&types, parent) {
            Some(desc) if desc.is_value_type => Err(TypeError::ValueTypeParent(parent)),
            Some(desc) => Ok(desc.size),
            None => Err(TypeError::UnknownParent(parent)),
        }
    }

    fn lookup(types: &[TypeDescriptor], id: TypeId) -> Option<&TypeDescriptor> {
        if id.0 < Self::MIN_INDEX {
            return None;
        }
        types.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.types.read().len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: TypeId) -> Option<TypeDescriptor> {
        Self::lookup(&self.types.read(), id).cloned()
    }

    pub fn name(&self, id: TypeId) -> Option<String> {
        Self::lookup(&self.types.read(), id).map(|desc| desc.name.clone())
    }

    pub fn instance_size(&self, id: TypeId) -> Option<usize> {
        Self::lookup(&self.types.read(), id).map(|desc| desc.size)
    }

    pub fn is_value_type(&self, id: TypeId) -> Option<bool> {
        Self::lookup(&self.types.read(), id).map(|desc| desc.is_value_type)
    }

    /// Bytes one array element of type `id` occupies.
    pub fn element_stride(&self, id: TypeId) -> Option<usize> {
        Self::lookup(&self.types.read(), id).map(|desc| {
            if desc.is_value_type {
                desc.size
            } else {
                REFERENCE_SIZE
            }
        })
    }

    /// Visit the fields of `id` and of every ancestor, most derived first.
    pub fn for_each_field(&self, id: TypeId, mut visitor: impl FnMut(&FieldDescriptor)) {
        let types = self.types.read();
        let mut current = Some(id);
        let mut depth = 0;
        while let Some(ty) = current {
            let Some(desc) = Self::lookup(&types, ty) else {
                break;
            };
            desc.fields.iter().for_each(&mut visitor);
            current = desc.parent;
            depth += 1;
            debug_assert!(depth < types.len(), "cyclic parent chain");
        }
    }

    /// Payload offsets of every managed reference field of `id`, inherited ones included.
    pub fn reference_offsets(&self, id: TypeId) -> Vec<usize> {
        let mut offsets = Vec::new();
        self.for_each_field(id, |field| {
            if field.kind == FieldKind::Reference {
                offsets.push(field.offset);
            }
        });
        offsets
    }

    /// The field of `id` (or an ancestor) at payload offset `offset`.
    pub fn field_at(&self, id: TypeId, offset: usize) -> Option<FieldDescriptor> {
        let mut found = None;
        self.for_each_field(id, |field| {
            if found.is_none() && field.offset == offset {
                found = Some(field.clone());
            }
        });
        found
    }

    /// Offset of the field called `name` in `id` or an ancestor.
    pub fn field_offset(&self, id: TypeId, name: &str) -> Option<usize> {
        let mut found = None;
        self.for_each_field(id, |field| {
            if found.is_none() && field.name == name {
                found = Some(field.offset);
            }
        });
        found
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeTable").field("types", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_aligns_fields() {
        let table = TypeTable::new();
        let id = table
            .define(
                TypeDescriptor::class("Mixed")
                    .value("flag", 1)
                    .reference("next")
                    .value("count", 4)
                    .pointer("raw"),
            )
            .unwrap();
        let desc = table.get(id).unwrap();
        let offsets: Vec<_> = desc.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 24]);
        assert_eq!(desc.size, 32);
        assert_eq!(table.reference_offsets(id), vec![8]);
    }

    #[test]
    fn inherited_fields_follow_the_parent() {
        let table = TypeTable::new();
        let base = table
            .define(TypeDescriptor::class("Base").reference("left").value("tag", 4))
            .unwrap();
        let derived = table
            .define(TypeDescriptor::class("Derived").extends(base).reference("right"))
            .unwrap();
        assert_eq!(table.instance_size(base), Some(16));
        assert_eq!(table.instance_size(derived), Some(24));
        assert_eq!(table.reference_offsets(derived), vec![16, 0]);
        assert_eq!(table.field_offset(derived, "left"), Some(0));
        assert_eq!(table.field_offset(derived, "right"), Some(16));
        assert_eq!(
            table.field_at(derived, 8).map(|f| f.kind),
            Some(FieldKind::Value)
        );
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        let table = TypeTable::new();
        assert_eq!(
            table.define(TypeDescriptor::class("Orphan").extends(TypeId(42))),
            Err(TypeError::UnknownParent(TypeId(42)))
        );
        let int = table.register(TypeDescriptor::value_type("Int32", 4)).unwrap();
        assert_eq!(
            table.define(TypeDescriptor::class("Boxed").extends(int)),
            Err(TypeError::ValueTypeParent(int))
        );
        let mut broken = TypeDescriptor::value_type("Broken", 4);
        broken.fields.push(FieldDescriptor {
            name: "wide".into(),
            offset: 0,
            size: 8,
            kind: FieldKind::Value,
        });
        assert!(matches!(
            table.register(broken),
            Err(TypeError::FieldOutOfBounds { .. })
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn derived_instance_must_cover_parent() {
        let table = TypeTable::new();
        let base = table
            .define(TypeDescriptor::class("Base").reference("r"))
            .unwrap();
        let mut shrunk = TypeDescriptor::value_type("Derived", 0);
        shrunk.is_value_type = false;
        shrunk.parent = Some(base);
        assert_eq!(
            table.register(shrunk.clone()),
            Err(TypeError::BadInstanceSize {
                type_name: "Derived".into(),
                size: 0
            })
        );
        shrunk.size = REFERENCE_SIZE + 4;
        assert!(matches!(
            table.register(shrunk.clone()),
            Err(TypeError::BadInstanceSize { .. })
        ));
        shrunk.size = REFERENCE_SIZE;
        assert!(table.register(shrunk).is_ok());
    }

    #[test]
    fn reference_fields_must_be_aligned() {
        let table = TypeTable::new();
        let mut skewed = TypeDescriptor::value_type("Skewed", 2 * REFERENCE_SIZE);
        skewed.is_value_type = false;
        skewed.fields.push(FieldDescriptor {
            name: "next".into(),
            offset: 4,
            size: REFERENCE_SIZE,
            kind: FieldKind::Reference,
        });
        assert_eq!(
            table.register(skewed.clone()),
            Err(TypeError::MisalignedField {
                type_name: "Skewed".into(),
                field: "next".into()
            })
        );
        skewed.fields[0].offset = 0;
        skewed.fields[0].size = 4;
        skewed.fields[0].kind = FieldKind::Pointer;
        assert!(matches!(
            table.register(skewed.clone()),
            Err(TypeError::MisalignedField { .. })
        ));
        skewed.fields[0].size = REFERENCE_SIZE;
        assert!(table.register(skewed).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn element_strides() {
        let table = TypeTable::new();
        let int = table.register(TypeDescriptor::value_type("Int16", 2)).unwrap();
        let node = table.define(TypeDescriptor::class("Node").value("x", 8)).unwrap();
        assert_eq!(table.element_stride(int), Some(2));
        assert_eq!(table.element_stride(node), Some(REFERENCE_SIZE));
        assert_eq!(table.element_stride(TypeId::NONE), None);
    }
}
