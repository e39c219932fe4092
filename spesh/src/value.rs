//! The runtime values and object representation queries the engine needs. Object layout itself is
//! owned by the embedding runtime: the engine only asks questions of it through [ObjectModel].

use crate::callsite::{ObservedType, TypeId};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};

/// A value as held in a frame register or lexical slot.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Int(i64),
    Num(f64),
    Str(Arc<str>),
    Obj(Arc<Object>),
}

impl Value {
    /// The observed type of this value, if it is an object.
    pub fn observed_type(&self) -> Option<ObservedType> {
        match self {
            Value::Obj(o) => Some(ObservedType {
                ty: o.ty,
                concrete: o.concrete,
            }),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Num(x), Value::Num(y)) => x.to_bits() == y.to_bits(),
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Num(x) => write!(f, "{x:?}"),
            Value::Str(x) => write!(f, "{x:?}"),
            Value::Obj(x) => write!(f, "<{}{}>", x.ty, if x.concrete { "" } else { ":U" }),
        }
    }
}

/// A heap object: either a type object (`concrete == false`) or an instance with one value per
/// field of its layout.
#[derive(Debug)]
pub struct Object {
    pub ty: TypeId,
    pub concrete: bool,
    pub fields: Mutex<Vec<Value>>,
}

impl Object {
    pub fn instance(ty: TypeId, fields: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            ty,
            concrete: true,
            fields: Mutex::new(fields),
        })
    }

    pub fn type_object(ty: TypeId) -> Arc<Self> {
        Arc::new(Self {
            ty,
            concrete: false,
            fields: Mutex::new(Vec::new()),
        })
    }
}

/// How a single field of an object layout is stored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldKind {
    Int,
    Num,
    Str,
    /// An unboxed value of the given type stored inline in the object.
    Flattened(TypeId),
    /// A reference to another object, whose type is known only if `Some`.
    Ref(Option<TypeId>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub name: Arc<str>,
    pub kind: FieldKind,
}

/// How values of a type are stored as a whole.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StorageKind {
    /// A plain object with a (possibly empty) field layout.
    Object,
    /// A container that must be deconted to get at the value inside.
    Container,
    /// A boxed native integer, number, or string.
    BoxedInt,
    BoxedNum,
    BoxedStr,
}

/// Object representation queries.
pub trait ObjectModel: Send + Sync {
    /// The flat field layout of instances of `ty`, if it is statically fully known.
    fn field_layout(&self, ty: TypeId) -> Option<Arc<[FieldLayout]>>;

    fn storage_kind(&self, ty: TypeId) -> StorageKind;
}

/// The size in bytes of each field slot: field `i` lives at offset `i * FIELD_SLOT_SIZE`.
pub const FIELD_SLOT_SIZE: i16 = 8;

/// A simple table-driven [ObjectModel].
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<TypeId, (StorageKind, Option<Arc<[FieldLayout]>>)>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain object type with the given fields.
    pub fn with_object(mut self, ty: TypeId, fields: &[(&str, FieldKind)]) -> Self {
        let layout = fields
            .iter()
            .map(|(name, kind)| FieldLayout {
                name: Arc::from(*name),
                kind: *kind,
            })
            .collect::<Vec<_>>();
        self.types
            .insert(ty, (StorageKind::Object, Some(Arc::from(layout))));
        self
    }

    /// Register a type whose layout is not statically known.
    pub fn with_opaque(mut self, ty: TypeId, kind: StorageKind) -> Self {
        self.types.insert(ty, (kind, None));
        self
    }
}

impl ObjectModel for TypeRegistry {
    fn field_layout(&self, ty: TypeId) -> Option<Arc<[FieldLayout]>> {
        self.types.get(&ty).and_then(|(_, l)| l.clone())
    }

    fn storage_kind(&self, ty: TypeId) -> StorageKind {
        self.types
            .get(&ty)
            .map(|(k, _)| *k)
            .unwrap_or(StorageKind::Container)
    }
}
