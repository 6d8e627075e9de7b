//! Per-object binary serialization.
//!
//! Objects serialize to a self-describing binary form: properties are keyed
//! by name hash, so a deserializer with a different property order (or with
//! properties appended since) maps them onto the live layout. Objects are
//! identified by uuid, and owned subobjects nest inline. Unknown types
//! fail the load; unknown properties fall back to default values with a
//! logged warning.

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::hash::NameHash;
use crate::object::{ObjectId, PropertyValue, SetDelta};
use crate::store::Truth;
use crate::types::PropertyKind;
use crate::undo::NO_UNDO_SCOPE;
use crate::TruthError;

/// A reference to an object in another store: its uuid plus its type, so a
/// placeholder can be created before the object itself arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRef {
    uuid: Uuid,
    type_hash: NameHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Buffer(Option<Vec<u8>>),
    Reference(Option<WireRef>),
    Subobject(Option<Box<WireObject>>),
    ReferenceSet {
        added: Vec<WireRef>,
        removed: Vec<WireRef>,
    },
    SubobjectSet {
        added: Vec<WireObject>,
        removed: Vec<WireRef>,
        instantiated: Vec<WireObject>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireProperty {
    name_hash: NameHash,
    value: WireValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireObject {
    type_hash: NameHash,
    uuid: Uuid,
    prototype: Option<WireRef>,
    properties: Vec<WireProperty>,
}

impl Truth {
    fn wire_ref(&self, id: ObjectId) -> Option<WireRef> {
        if id.is_none() {
            return None;
        }
        let uuid = self.uuid(id)?;
        let type_hash = self.types().info_checked(id.type_index())?.name_hash;
        Some(WireRef { uuid, type_hash })
    }

    fn wire_object(&self, id: ObjectId) -> Result<WireObject, TruthError> {
        let snap = self.read(id).ok_or(TruthError::DeadObject(id))?;
        let info = snap.type_info();
        let mut properties = Vec::new();
        for (index, def) in info.properties.iter().enumerate() {
            let property = index as u32;
            if def.not_serialized {
                continue;
            }
            let is_set = matches!(
                def.kind,
                PropertyKind::ReferenceSet | PropertyKind::SubobjectSet
            );
            if !is_set && !snap.is_overridden(property) {
                // Non-overridden values resolve through the prototype on
                // load; only local state is serialized.
                continue;
            }
            let value = match snap.local_value(property).expect("values match table") {
                PropertyValue::Bool(v) => WireValue::Bool(*v),
                PropertyValue::U32(v) => WireValue::U32(*v),
                PropertyValue::U64(v) => WireValue::U64(*v),
                PropertyValue::F32(v) => WireValue::F32(*v),
                PropertyValue::F64(v) => WireValue::F64(*v),
                PropertyValue::Str(v) => WireValue::Str(v.to_string()),
                PropertyValue::Buffer(v) => {
                    WireValue::Buffer(v.as_ref().map(|b| b.data().to_vec()))
                }
                PropertyValue::Reference(v) => WireValue::Reference(self.wire_ref(*v)),
                PropertyValue::Subobject(v) => {
                    let inner = if v.is_some() {
                        Some(Box::new(self.wire_object(*v)?))
                    } else {
                        None
                    };
                    WireValue::Subobject(inner)
                }
                PropertyValue::ReferenceSet(delta) => WireValue::ReferenceSet {
                    added: delta.added.iter().filter_map(|&i| self.wire_ref(i)).collect(),
                    removed: delta
                        .removed
                        .iter()
                        .filter_map(|&i| self.wire_ref(i))
                        .collect(),
                },
                PropertyValue::SubobjectSet(delta) => {
                    let mut added = Vec::with_capacity(delta.added.len());
                    for &child in &delta.added {
                        added.push(self.wire_object(child)?);
                    }
                    let mut instantiated = Vec::with_capacity(delta.instantiated.len());
                    for &child in &delta.instantiated {
                        instantiated.push(self.wire_object(child)?);
                    }
                    WireValue::SubobjectSet {
                        added,
                        removed: delta
                            .removed
                            .iter()
                            .filter_map(|&i| self.wire_ref(i))
                            .collect(),
                        instantiated,
                    }
                }
            };
            properties.push(WireProperty {
                name_hash: def.name_hash,
                value,
            });
        }
        Ok(WireObject {
            type_hash: info.name_hash,
            uuid: self.uuid(id).unwrap_or_else(Uuid::nil),
            prototype: self.wire_ref(snap.prototype()),
            properties,
        })
    }

    /// Serialize an object (including its owned subobjects) to bytes.
    pub fn serialize_object(&self, id: ObjectId) -> Result<Vec<u8>, TruthError> {
        let wire = self.wire_object(id)?;
        bincode::serde::encode_to_vec(&wire, bincode::config::standard())
            .map_err(|e| TruthError::Wire(e.to_string()))
    }

    /// Deserialize an object serialized with
    /// [`serialize_object`](Truth::serialize_object). Objects are matched
    /// up by uuid; referenced-but-absent objects become placeholders.
    pub fn deserialize_object(&self, data: &[u8]) -> Result<ObjectId, TruthError> {
        let (wire, _len): (WireObject, usize) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| TruthError::Wire(e.to_string()))?;
        self.materialize_wire_object(&wire, ObjectId::NONE)
    }

    fn resolve_wire_ref(&self, r: &Option<WireRef>) -> ObjectId {
        let Some(r) = r else {
            return ObjectId::NONE;
        };
        let Some(ty) = self.types().find_type(r.type_hash) else {
            warn!(
                type_hash = r.type_hash,
                "reference to unknown type dropped"
            );
            return ObjectId::NONE;
        };
        self.resolve_or_create_placeholder(r.uuid, ty)
    }

    fn materialize_wire_object(
        &self,
        wire: &WireObject,
        owner: ObjectId,
    ) -> Result<ObjectId, TruthError> {
        let ty = self
            .types()
            .find_type(wire.type_hash)
            .ok_or(TruthError::UnknownType(wire.type_hash))?;
        let id = self.resolve_or_create_placeholder(wire.uuid, ty);
        let prototype = self.resolve_wire_ref(&wire.prototype);

        let mut w = self.write(id)?;
        w.snap.owner = owner;
        if prototype.is_some() && w.snap.prototype != prototype {
            w.snap.prototype = prototype;
            self.register_instance(prototype, id);
        }
        let info = self.types().info(ty).clone();
        for wp in &wire.properties {
            let Some(property) = info.property_index(wp.name_hash) else {
                warn!(
                    type_name = %info.name,
                    name_hash = wp.name_hash,
                    "serialized property unknown to live type, using default"
                );
                continue;
            };
            let kind = info.property(property).expect("in range").kind;
            let value = match (&wp.value, kind) {
                (WireValue::Bool(v), PropertyKind::Bool) => PropertyValue::Bool(*v),
                (WireValue::U32(v), PropertyKind::U32) => PropertyValue::U32(*v),
                (WireValue::U64(v), PropertyKind::U64) => PropertyValue::U64(*v),
                (WireValue::F32(v), PropertyKind::F32) => PropertyValue::F32(*v),
                (WireValue::F64(v), PropertyKind::F64) => PropertyValue::F64(*v),
                (WireValue::Str(v), PropertyKind::Str) => {
                    PropertyValue::Str(self.interner().intern(v))
                }
                (WireValue::Buffer(v), PropertyKind::Buffer) => PropertyValue::Buffer(
                    v.as_ref().map(|bytes| self.buffers().add(bytes.clone(), None)),
                ),
                (WireValue::Reference(v), PropertyKind::Reference) => {
                    PropertyValue::Reference(self.resolve_wire_ref(v))
                }
                (WireValue::Subobject(v), PropertyKind::Subobject) => {
                    let child = match v {
                        Some(inner) => self.materialize_wire_object(inner, id)?,
                        None => ObjectId::NONE,
                    };
                    PropertyValue::Subobject(child)
                }
                (WireValue::ReferenceSet { added, removed }, PropertyKind::ReferenceSet) => {
                    PropertyValue::ReferenceSet(SetDelta {
                        added: added
                            .iter()
                            .map(|r| self.resolve_wire_ref(&Some(r.clone())))
                            .collect(),
                        removed: removed
                            .iter()
                            .map(|r| self.resolve_wire_ref(&Some(r.clone())))
                            .collect(),
                        instantiated: Vec::new(),
                    })
                }
                (
                    WireValue::SubobjectSet {
                        added,
                        removed,
                        instantiated,
                    },
                    PropertyKind::SubobjectSet,
                ) => {
                    let mut delta = SetDelta::default();
                    for child in added {
                        delta.added.push(self.materialize_wire_object(child, id)?);
                    }
                    for child in instantiated {
                        delta
                            .instantiated
                            .push(self.materialize_wire_object(child, id)?);
                    }
                    delta.removed = removed
                        .iter()
                        .map(|r| self.resolve_wire_ref(&Some(r.clone())))
                        .collect();
                    PropertyValue::SubobjectSet(delta)
                }
                _ => {
                    warn!(
                        type_name = %info.name,
                        property,
                        "serialized value does not match property kind, using default"
                    );
                    continue;
                }
            };
            w.snap.set_local_value(property, value);
        }
        self.commit(w, NO_UNDO_SCOPE);
        Ok(id)
    }
}
