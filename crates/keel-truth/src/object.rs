//! Object identity and snapshots.
//!
//! An [`ObjectId`] is a weak, generation-checked 64-bit handle. The value of
//! an object at a point in time is an [`ObjectSnapshot`]: immutable once
//! published, cheap to clone (property payloads are shared or small), and
//! safe to read from any thread.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffers::BufferRef;
use crate::types::{PropertyKind, TypeIndex, TypeInfo};

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// A weak reference to an object.
///
/// Layout: `[type_index: u16 | generation: u16 | slot_index: u32]`.
/// Slot index 0 is never allocated, so the all-zero value means "no object".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The "no object" id.
    pub const NONE: ObjectId = ObjectId(0);

    #[inline]
    pub(crate) fn new(ty: TypeIndex, generation: u16, index: u32) -> Self {
        Self((ty.0 as u64) << 48 | (generation as u64) << 32 | index as u64)
    }

    /// The object's type index.
    #[inline]
    pub fn type_index(self) -> TypeIndex {
        TypeIndex((self.0 >> 48) as u32)
    }

    /// Generation counter at the time the id was handed out.
    #[inline]
    pub fn generation(self) -> u16 {
        (self.0 >> 32) as u16
    }

    /// Slot index in the object store.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// Whether this is the "no object" id.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this refers to some object (alive or not).
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Raw 64-bit representation (serialization, changelog wire format).
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from the raw representation.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ObjectId(none)")
        } else {
            write!(
                f,
                "ObjectId(t{} {}v{})",
                self.type_index().raw(),
                self.index(),
                self.generation()
            )
        }
    }
}

// ---------------------------------------------------------------------------
// SetDelta
// ---------------------------------------------------------------------------

/// Local modifications of a set-valued property against the prototype's
/// effective set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetDelta {
    /// Locally added elements.
    pub added: Vec<ObjectId>,
    /// Inherited elements locally removed.
    pub removed: Vec<ObjectId>,
    /// Local clones replacing inherited elements; each clone's prototype is
    /// the inherited element it replaces.
    pub instantiated: Vec<ObjectId>,
}

impl SetDelta {
    /// Whether no local modifications exist.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.instantiated.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PropertyValue
// ---------------------------------------------------------------------------

/// The stored value of a single property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(Arc<str>),
    Buffer(Option<BufferRef>),
    Reference(ObjectId),
    Subobject(ObjectId),
    ReferenceSet(SetDelta),
    SubobjectSet(SetDelta),
}

impl PropertyValue {
    /// The zero value for a property kind.
    pub fn default_for(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Bool => PropertyValue::Bool(false),
            PropertyKind::U32 => PropertyValue::U32(0),
            PropertyKind::U64 => PropertyValue::U64(0),
            PropertyKind::F32 => PropertyValue::F32(0.0),
            PropertyKind::F64 => PropertyValue::F64(0.0),
            PropertyKind::Str => PropertyValue::Str(Arc::from("")),
            PropertyKind::Buffer => PropertyValue::Buffer(None),
            PropertyKind::Reference => PropertyValue::Reference(ObjectId::NONE),
            PropertyKind::Subobject => PropertyValue::Subobject(ObjectId::NONE),
            PropertyKind::ReferenceSet => PropertyValue::ReferenceSet(SetDelta::default()),
            PropertyKind::SubobjectSet => PropertyValue::SubobjectSet(SetDelta::default()),
        }
    }

    /// The kind this value belongs to.
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::U32(_) => PropertyKind::U32,
            PropertyValue::U64(_) => PropertyKind::U64,
            PropertyValue::F32(_) => PropertyKind::F32,
            PropertyValue::F64(_) => PropertyKind::F64,
            PropertyValue::Str(_) => PropertyKind::Str,
            PropertyValue::Buffer(_) => PropertyKind::Buffer,
            PropertyValue::Reference(_) => PropertyKind::Reference,
            PropertyValue::Subobject(_) => PropertyKind::Subobject,
            PropertyValue::ReferenceSet(_) => PropertyKind::ReferenceSet,
            PropertyValue::SubobjectSet(_) => PropertyKind::SubobjectSet,
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectSnapshot
// ---------------------------------------------------------------------------

/// The immutable value of an object at a point in time.
///
/// Published snapshots are never mutated; a write produces a private clone
/// that replaces the slot's snapshot on commit. Readers holding an
/// `Arc<ObjectSnapshot>` see a consistent, torn-free value for as long as
/// they keep the handle.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    pub(crate) id: ObjectId,
    pub(crate) type_info: Arc<TypeInfo>,
    pub(crate) owner: ObjectId,
    pub(crate) prototype: ObjectId,
    pub(crate) alive: bool,
    pub(crate) pseudo: bool,
    pub(crate) values: Vec<PropertyValue>,
    /// Bit `i` set means property `i` is locally overridden.
    pub(crate) overridden: u64,
}

impl ObjectSnapshot {
    /// A default-initialized snapshot for a freshly created object.
    pub(crate) fn new(id: ObjectId, type_info: Arc<TypeInfo>) -> Self {
        let values = type_info
            .properties
            .iter()
            .map(|p| PropertyValue::default_for(p.kind))
            .collect();
        Self {
            id,
            type_info,
            owner: ObjectId::NONE,
            prototype: ObjectId::NONE,
            alive: true,
            pseudo: false,
            values,
            overridden: 0,
        }
    }

    /// The object this snapshot belongs to.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The object's type description.
    #[inline]
    pub fn type_info(&self) -> &Arc<TypeInfo> {
        &self.type_info
    }

    /// Owner of this object (`NONE` for root objects).
    #[inline]
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    /// Prototype this object inherits from (`NONE` if standalone).
    #[inline]
    pub fn prototype(&self) -> ObjectId {
        self.prototype
    }

    /// Whether the object is alive (ghost prototypes stay readable with
    /// `alive == false`).
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whether the object is a transient pseudo-object.
    #[inline]
    pub fn is_pseudo(&self) -> bool {
        self.pseudo
    }

    /// The locally stored value of a property (no prototype resolution).
    #[inline]
    pub fn local_value(&self, property: u32) -> Option<&PropertyValue> {
        self.values.get(property as usize)
    }

    /// Whether the property is locally overridden.
    #[inline]
    pub fn is_overridden(&self, property: u32) -> bool {
        property < 64 && self.overridden & (1 << property) != 0
    }

    /// The local set delta of a set-valued property, if it is one.
    pub fn set_delta(&self, property: u32) -> Option<&SetDelta> {
        match self.values.get(property as usize) {
            Some(PropertyValue::ReferenceSet(d)) | Some(PropertyValue::SubobjectSet(d)) => Some(d),
            _ => None,
        }
    }

    // -- internal mutation (only reachable through a write) ------------------

    pub(crate) fn set_local_value(&mut self, property: u32, value: PropertyValue) {
        self.values[property as usize] = value;
        self.overridden |= 1 << property;
    }

    pub(crate) fn clear_override(&mut self, property: u32) {
        let kind = self.type_info.properties[property as usize].kind;
        self.values[property as usize] = PropertyValue::default_for(kind);
        self.overridden &= !(1 << property);
    }

    pub(crate) fn set_delta_mut(&mut self, property: u32) -> Option<&mut SetDelta> {
        match self.values.get_mut(property as usize) {
            Some(PropertyValue::ReferenceSet(d)) | Some(PropertyValue::SubobjectSet(d)) => Some(d),
            _ => None,
        }
    }
}
