//! Change tracking: per-type ring buffers and the optional changelog.
//!
//! The tracker stamps every commit with a monotone version and keeps the
//! last [`CHANGE_RING_SIZE`] modified ids per type, so pollers can ask
//! "what changed since version v" cheaply. When a poller falls behind the
//! ring, the answer carries an overflow flag instead of silently dropping
//! changes.
//!
//! The changelog records every operation with before/after values. It is
//! reference-counted (enabled while at least one consumer holds a handle)
//! and can be paused for bulk operations. [`Truth::serialize_changes`] /
//! [`Truth::deserialize_changes`] turn a changelog range into a binary
//! stream for mirroring a store across a connection; the first batch
//! carries a type-table header that peers need exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::object::{ObjectId, ObjectSnapshot, PropertyValue, SetDelta};
use crate::store::Truth;
use crate::types::PropertyKind;
use crate::undo::NO_UNDO_SCOPE;
use crate::TruthError;

/// Capacity of each per-type ring of recently modified objects.
pub const CHANGE_RING_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// ChangeTracker
// ---------------------------------------------------------------------------

/// Result of a [`Truth::changed_objects`] query.
#[derive(Debug, Clone)]
pub struct ChangedObjects {
    /// Modified object ids since the queried version. Ids may repeat and
    /// may refer to slots that have since been reused.
    pub objects: Vec<ObjectId>,
    /// True when the caller fell behind the ring (or asked about the
    /// future); some changes may be missing from `objects`.
    pub overflow: bool,
    /// The current tracker version; pass as `since` next time.
    pub version: u64,
}

struct Ring {
    entries: VecDeque<(ObjectId, u64)>,
    /// Stamp of the newest entry pushed out of the ring.
    dropped_newest: u64,
}

/// Stamps commits and keeps per-type rings of modified ids.
pub(crate) struct ChangeTracker {
    counter: AtomicU64,
    rings: Mutex<HashMap<u32, Ring>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn record(&self, id: ObjectId) -> u64 {
        let stamp = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let mut rings = self.rings.lock().expect("tracker poisoned");
        let ring = rings
            .entry(id.type_index().raw())
            .or_insert_with(|| Ring {
                entries: VecDeque::with_capacity(CHANGE_RING_SIZE),
                dropped_newest: 0,
            });
        if ring.entries.len() == CHANGE_RING_SIZE {
            if let Some((_, dropped)) = ring.entries.pop_front() {
                ring.dropped_newest = dropped;
            }
        }
        ring.entries.push_back((id, stamp));
        stamp
    }

    pub fn changed_objects(&self, ty: crate::types::TypeIndex, since: u64) -> ChangedObjects {
        let version = self.version();
        if since > version {
            return ChangedObjects {
                objects: Vec::new(),
                overflow: true,
                version,
            };
        }
        let rings = self.rings.lock().expect("tracker poisoned");
        match rings.get(&ty.raw()) {
            Some(ring) => ChangedObjects {
                objects: ring
                    .entries
                    .iter()
                    .filter(|(_, stamp)| *stamp > since)
                    .map(|(id, _)| *id)
                    .collect(),
                overflow: since < ring.dropped_newest,
                version,
            },
            None => ChangedObjects {
                objects: Vec::new(),
                overflow: false,
                version,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Changelog data model
// ---------------------------------------------------------------------------

/// A property value flattened for the wire: shared handles become owned
/// payloads, object references become raw 64-bit ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Buffer(Option<Vec<u8>>),
    Reference(u64),
    Subobject(u64),
    ReferenceSet {
        added: Vec<u64>,
        removed: Vec<u64>,
    },
    SubobjectSet {
        added: Vec<u64>,
        removed: Vec<u64>,
        instantiated: Vec<u64>,
    },
}

impl ChangeValue {
    fn from_property(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(v) => ChangeValue::Bool(*v),
            PropertyValue::U32(v) => ChangeValue::U32(*v),
            PropertyValue::U64(v) => ChangeValue::U64(*v),
            PropertyValue::F32(v) => ChangeValue::F32(*v),
            PropertyValue::F64(v) => ChangeValue::F64(*v),
            PropertyValue::Str(v) => ChangeValue::Str(v.to_string()),
            PropertyValue::Buffer(v) => {
                ChangeValue::Buffer(v.as_ref().map(|b| b.data().to_vec()))
            }
            PropertyValue::Reference(v) => ChangeValue::Reference(v.to_raw()),
            PropertyValue::Subobject(v) => ChangeValue::Subobject(v.to_raw()),
            PropertyValue::ReferenceSet(d) => ChangeValue::ReferenceSet {
                added: d.added.iter().map(|i| i.to_raw()).collect(),
                removed: d.removed.iter().map(|i| i.to_raw()).collect(),
            },
            PropertyValue::SubobjectSet(d) => ChangeValue::SubobjectSet {
                added: d.added.iter().map(|i| i.to_raw()).collect(),
                removed: d.removed.iter().map(|i| i.to_raw()).collect(),
                instantiated: d.instantiated.iter().map(|i| i.to_raw()).collect(),
            },
        }
    }
}

/// One recorded store operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeOp {
    Create {
        object: u64,
        type_hash: u64,
    },
    Destroy {
        object: u64,
    },
    SetProperty {
        object: u64,
        property_hash: u64,
        before: ChangeValue,
        after: ChangeValue,
    },
}

/// A changelog entry: the operation plus its absolute index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub index: u64,
    pub op: ChangeOp,
}

/// One type of the wire header's type table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeTableEntry {
    pub type_hash: u64,
    pub property_hashes: Vec<u64>,
}

/// The wire format: an optional one-time header, then operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeBatch {
    header: Option<Vec<TypeTableEntry>>,
    first_index: u64,
    ops: Vec<ChangeOp>,
}

// ---------------------------------------------------------------------------
// Changelog
// ---------------------------------------------------------------------------

struct ChangelogInner {
    refcount: u32,
    disabled: u32,
    next_handle: u64,
    first_index: u64,
    ops: VecDeque<ChangeOp>,
    header_sent: bool,
}

/// Reference-counted operation log. Recording happens only while at least
/// one handle is held and no disable scope is active.
pub(crate) struct Changelog {
    inner: Mutex<ChangelogInner>,
}

impl Changelog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChangelogInner {
                refcount: 0,
                disabled: 0,
                next_handle: 1,
                first_index: 0,
                ops: VecDeque::new(),
                header_sent: false,
            }),
        }
    }

    pub fn request(&self) -> u64 {
        let mut inner = self.inner.lock().expect("changelog poisoned");
        inner.refcount += 1;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        handle
    }

    pub fn relinquish(&self, _handle: u64) {
        let mut inner = self.inner.lock().expect("changelog poisoned");
        if inner.refcount == 0 {
            warn!("changelog relinquished more often than requested");
            return;
        }
        inner.refcount -= 1;
        if inner.refcount == 0 {
            inner.first_index += inner.ops.len() as u64;
            inner.ops.clear();
        }
    }

    pub fn active(&self) -> bool {
        let inner = self.inner.lock().expect("changelog poisoned");
        inner.refcount > 0 && inner.disabled == 0
    }

    pub fn begin_disable(&self) {
        self.inner.lock().expect("changelog poisoned").disabled += 1;
    }

    pub fn end_disable(&self) {
        let mut inner = self.inner.lock().expect("changelog poisoned");
        if inner.disabled == 0 {
            warn!("changelog disable scope ended more often than begun");
            return;
        }
        inner.disabled -= 1;
    }

    pub fn push(&self, op: ChangeOp) {
        let mut inner = self.inner.lock().expect("changelog poisoned");
        if inner.refcount == 0 || inner.disabled > 0 {
            return;
        }
        inner.ops.push_back(op);
    }

    /// The index one past the last recorded op.
    pub fn end_index(&self) -> u64 {
        let inner = self.inner.lock().expect("changelog poisoned");
        inner.first_index + inner.ops.len() as u64
    }

    pub fn entries(&self, begin: u64, end: u64) -> Vec<ChangelogEntry> {
        let inner = self.inner.lock().expect("changelog poisoned");
        let lo = begin.max(inner.first_index);
        let hi = end.min(inner.first_index + inner.ops.len() as u64);
        (lo..hi)
            .map(|index| ChangelogEntry {
                index,
                op: inner.ops[(index - inner.first_index) as usize].clone(),
            })
            .collect()
    }

    fn take_header_duty(&self) -> bool {
        let mut inner = self.inner.lock().expect("changelog poisoned");
        if inner.header_sent {
            false
        } else {
            inner.header_sent = true;
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Pause guard
// ---------------------------------------------------------------------------

/// Suspends changelog recording for bulk operations (e.g. load) until
/// dropped.
pub struct ChangelogPause<'a> {
    truth: &'a Truth,
}

impl Drop for ChangelogPause<'_> {
    fn drop(&mut self) {
        self.truth.changelog.end_disable();
    }
}

// ---------------------------------------------------------------------------
// Truth integration
// ---------------------------------------------------------------------------

impl Truth {
    /// Enable the changelog; recording continues while any handle is held.
    pub fn request_changelog(&self) -> u64 {
        self.changelog.request()
    }

    /// Give back a changelog handle. When the last handle is gone, recorded
    /// operations are released.
    pub fn relinquish_changelog(&self, handle: u64) {
        self.changelog.relinquish(handle);
    }

    /// Suspend changelog recording until the guard is dropped.
    pub fn pause_changelog(&self) -> ChangelogPause<'_> {
        self.changelog.begin_disable();
        ChangelogPause { truth: self }
    }

    /// The index one past the last recorded changelog operation.
    pub fn changelog_end(&self) -> u64 {
        self.changelog.end_index()
    }

    /// Recorded operations in `[begin, end)`.
    pub fn changelog_entries(&self, begin: u64, end: u64) -> Vec<ChangelogEntry> {
        self.changelog.entries(begin, end)
    }

    pub(crate) fn record_changelog_create(&self, id: ObjectId) {
        let type_hash = self
            .types()
            .info_checked(id.type_index())
            .map(|info| info.name_hash)
            .unwrap_or(0);
        self.changelog.push(ChangeOp::Create {
            object: id.to_raw(),
            type_hash,
        });
    }

    pub(crate) fn record_changelog_diff(
        &self,
        old: Option<&ObjectSnapshot>,
        new: &ObjectSnapshot,
    ) {
        let info = new.type_info();
        for (index, def) in info.properties.iter().enumerate() {
            let property = index as u32;
            let new_value = new.local_value(property).expect("values match table");
            let old_value = old.and_then(|o| o.local_value(property));
            let changed = match old_value {
                Some(old_value) => old_value != new_value,
                None => *new_value != PropertyValue::default_for(def.kind),
            };
            if !changed {
                continue;
            }
            let before = old_value
                .map(ChangeValue::from_property)
                .unwrap_or_else(|| {
                    ChangeValue::from_property(&PropertyValue::default_for(def.kind))
                });
            self.changelog.push(ChangeOp::SetProperty {
                object: new.id().to_raw(),
                property_hash: def.name_hash,
                before,
                after: ChangeValue::from_property(new_value),
            });
        }
    }

    /// Serialize changelog operations `[begin, end)` for network mirroring.
    /// The first batch ever produced carries the type-table header.
    pub fn serialize_changes(&self, begin: u64, end: u64) -> Result<Vec<u8>, TruthError> {
        let header = if self.changelog.take_header_duty() {
            let registry = self.types();
            let mut table = Vec::with_capacity(registry.len());
            for raw in 0..registry.len() as u32 {
                let info = registry.info(crate::types::TypeIndex(raw));
                table.push(TypeTableEntry {
                    type_hash: info.name_hash,
                    property_hashes: info.properties.iter().map(|p| p.name_hash).collect(),
                });
            }
            Some(table)
        } else {
            None
        };
        let ops = self
            .changelog
            .entries(begin, end)
            .into_iter()
            .map(|e| e.op)
            .collect();
        let batch = ChangeBatch {
            header,
            first_index: begin,
            ops,
        };
        bincode::serde::encode_to_vec(&batch, bincode::config::standard())
            .map_err(|e| TruthError::Wire(e.to_string()))
    }

    /// Apply a serialized change batch to this store. `remap` translates
    /// the peer's object ids to local ids and is extended by every applied
    /// create; pass the same map for every batch of a stream. Returns the
    /// number of applied operations.
    pub fn deserialize_changes(
        &self,
        data: &[u8],
        remap: &mut HashMap<u64, ObjectId>,
    ) -> Result<usize, TruthError> {
        let (batch, _len): (ChangeBatch, usize) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| TruthError::Wire(e.to_string()))?;
        if let Some(header) = &batch.header {
            for entry in header {
                if self.types().find_type(entry.type_hash).is_none() {
                    warn!(
                        type_hash = entry.type_hash,
                        "peer type unknown locally; its objects will be skipped"
                    );
                }
            }
        }
        let mut applied = 0;
        for op in &batch.ops {
            if self.apply_change_op(op, remap) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn apply_change_op(&self, op: &ChangeOp, remap: &mut HashMap<u64, ObjectId>) -> bool {
        match op {
            ChangeOp::Create { object, type_hash } => {
                let Some(ty) = self.types().find_type(*type_hash) else {
                    warn!(
                        type_hash,
                        "create for unknown type skipped"
                    );
                    return false;
                };
                let local = self.create_object_of_type(ty, NO_UNDO_SCOPE);
                remap.insert(*object, local);
                true
            }
            ChangeOp::Destroy { object } => {
                let local = remap
                    .get(object)
                    .copied()
                    .unwrap_or_else(|| ObjectId::from_raw(*object));
                self.destroy_object(local, NO_UNDO_SCOPE);
                true
            }
            ChangeOp::SetProperty {
                object,
                property_hash,
                after,
                ..
            } => {
                let local = remap
                    .get(object)
                    .copied()
                    .unwrap_or_else(|| ObjectId::from_raw(*object));
                let Some(snap) = self.read(local) else {
                    warn!(?local, "set for unknown object skipped");
                    return false;
                };
                let Some(property) = snap.type_info().property_index(*property_hash) else {
                    warn!(
                        ?local,
                        property_hash,
                        "unknown property in change stream, keeping default"
                    );
                    return false;
                };
                let kind = snap.type_info().property(property).expect("in range").kind;
                let Some(value) = self.change_value_to_property(after, kind, remap) else {
                    warn!(?local, property, "change value does not match property kind");
                    return false;
                };
                match self.write(local) {
                    Ok(mut w) => {
                        w.snap.set_local_value(property, value);
                        self.commit(w, NO_UNDO_SCOPE);
                        true
                    }
                    Err(err) => {
                        warn!(?local, %err, "set from change stream failed");
                        false
                    }
                }
            }
        }
    }

    fn change_value_to_property(
        &self,
        value: &ChangeValue,
        kind: PropertyKind,
        remap: &HashMap<u64, ObjectId>,
    ) -> Option<PropertyValue> {
        let map_id = |raw: &u64| {
            remap
                .get(raw)
                .copied()
                .unwrap_or_else(|| ObjectId::from_raw(*raw))
        };
        let value = match (value, kind) {
            (ChangeValue::Bool(v), PropertyKind::Bool) => PropertyValue::Bool(*v),
            (ChangeValue::U32(v), PropertyKind::U32) => PropertyValue::U32(*v),
            (ChangeValue::U64(v), PropertyKind::U64) => PropertyValue::U64(*v),
            (ChangeValue::F32(v), PropertyKind::F32) => PropertyValue::F32(*v),
            (ChangeValue::F64(v), PropertyKind::F64) => PropertyValue::F64(*v),
            (ChangeValue::Str(v), PropertyKind::Str) => {
                PropertyValue::Str(self.interner().intern(v))
            }
            (ChangeValue::Buffer(v), PropertyKind::Buffer) => PropertyValue::Buffer(
                v.as_ref()
                    .map(|bytes| self.buffers().add(bytes.clone(), None)),
            ),
            (ChangeValue::Reference(v), PropertyKind::Reference) => {
                PropertyValue::Reference(map_id(v))
            }
            (ChangeValue::Subobject(v), PropertyKind::Subobject) => {
                PropertyValue::Subobject(map_id(v))
            }
            (ChangeValue::ReferenceSet { added, removed }, PropertyKind::ReferenceSet) => {
                PropertyValue::ReferenceSet(SetDelta {
                    added: added.iter().map(map_id).collect(),
                    removed: removed.iter().map(map_id).collect(),
                    instantiated: Vec::new(),
                })
            }
            (
                ChangeValue::SubobjectSet {
                    added,
                    removed,
                    instantiated,
                },
                PropertyKind::SubobjectSet,
            ) => PropertyValue::SubobjectSet(SetDelta {
                added: added.iter().map(map_id).collect(),
                removed: removed.iter().map(map_id).collect(),
                instantiated: instantiated.iter().map(map_id).collect(),
            }),
            _ => return None,
        };
        Some(value)
    }
}
