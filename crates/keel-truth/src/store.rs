//! The authoritative object store.
//!
//! [`Truth`] owns every object: a slot table where each slot holds the
//! current snapshot behind an atomically swapped pointer. Reads acquire the
//! snapshot with a single atomic load and never block; writes clone the
//! snapshot, mutate the private copy, and publish it back with a
//! release-store ([`commit`](Truth::commit)) or a compare-and-swap
//! ([`try_commit`](Truth::try_commit)).
//!
//! Replaced snapshots are tombstoned and reclaimed by
//! [`garbage_collect`](Truth::garbage_collect), which also recycles
//! destroyed slots (bumping their generation so stale ids stay detectable).
//! `garbage_collect` takes `&mut self`: the exclusive borrow *is* the serial
//! safe point.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{error, warn};
use uuid::Uuid;

use crate::buffers::BufferStore;
use crate::changes::{ChangeTracker, Changelog, ChangedObjects};
use crate::interner::StringInterner;
use crate::object::{ObjectId, ObjectSnapshot, PropertyValue};
use crate::types::{PropertyDef, TypeIndex, TypeRegistry};
use crate::undo::{UndoAction, UndoLog, UndoScopeId, NO_UNDO_SCOPE};
use crate::TruthError;

// ---------------------------------------------------------------------------
// ObjectSlot
// ---------------------------------------------------------------------------

/// One slot of the object table.
///
/// The snapshot pointer is the only thing readers touch; everything else is
/// bookkeeping for commits and reclamation.
pub(crate) struct ObjectSlot {
    snapshot: ArcSwapOption<ObjectSnapshot>,
    /// Low 16 bits are compared against [`ObjectId::generation`].
    generation: AtomicU32,
    /// Strictly increasing across the process lifetime, including undo.
    version: AtomicU64,
    uuid: Mutex<Uuid>,
    /// Outstanding writers, maintained only when overlapping-write
    /// detection is enabled.
    writers: AtomicU32,
}

impl ObjectSlot {
    fn new() -> Self {
        Self {
            snapshot: ArcSwapOption::from(None),
            generation: AtomicU32::new(0),
            version: AtomicU64::new(0),
            uuid: Mutex::new(Uuid::nil()),
            writers: AtomicU32::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectWriter
// ---------------------------------------------------------------------------

/// A private mutable copy of an object, produced by [`Truth::write`] and
/// published by [`Truth::commit`] / [`Truth::try_commit`].
pub struct ObjectWriter {
    pub(crate) id: ObjectId,
    pub(crate) snap: ObjectSnapshot,
    /// The snapshot the copy was taken from; `try_commit` publishes only if
    /// this is still current.
    pub(crate) original: Arc<ObjectSnapshot>,
}

impl ObjectWriter {
    /// The object this writer targets.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The in-progress snapshot (local values only, no prototype resolution).
    #[inline]
    pub fn snapshot(&self) -> &ObjectSnapshot {
        &self.snap
    }
}

// ---------------------------------------------------------------------------
// Truth
// ---------------------------------------------------------------------------

struct SlotAlloc {
    free: VecDeque<u32>,
}

/// The versioned, copy-on-write authoritative object store.
pub struct Truth {
    registry: TypeRegistry,
    slots: ArcSwap<Vec<Arc<ObjectSlot>>>,
    alloc: Mutex<SlotAlloc>,
    interner: StringInterner,
    buffers: BufferStore,
    pub(crate) undo: UndoLog,
    pub(crate) tracker: ChangeTracker,
    pub(crate) changelog: Changelog,
    tombstones: Mutex<Vec<Arc<ObjectSnapshot>>>,
    pending_reclaim: Mutex<Vec<ObjectId>>,
    by_uuid: Mutex<HashMap<Uuid, ObjectId>>,
    /// prototype -> live instances created from it.
    instances: Mutex<HashMap<ObjectId, Vec<ObjectId>>>,
    overlap_detection: bool,
}

impl Default for Truth {
    fn default() -> Self {
        Self::new()
    }
}

impl Truth {
    /// Create an empty store.
    pub fn new() -> Self {
        // Slot 0 is reserved so that the all-zero ObjectId stays "none".
        let slots = vec![Arc::new(ObjectSlot::new())];
        Self {
            registry: TypeRegistry::new(),
            slots: ArcSwap::from_pointee(slots),
            alloc: Mutex::new(SlotAlloc {
                free: VecDeque::new(),
            }),
            interner: StringInterner::new(),
            buffers: BufferStore::new(),
            undo: UndoLog::new(),
            tracker: ChangeTracker::new(),
            changelog: Changelog::new(),
            tombstones: Mutex::new(Vec::new()),
            pending_reclaim: Mutex::new(Vec::new()),
            by_uuid: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            overlap_detection: false,
        }
    }

    /// Enable or disable overlapping-write detection. When enabled, two
    /// writers simultaneously holding copies of the same object trigger an
    /// error at commit time.
    pub fn set_overlapping_write_detection(&mut self, enabled: bool) {
        self.overlap_detection = enabled;
    }

    // -- type registry ------------------------------------------------------

    /// The type registry (lookups, aspects).
    pub fn types(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Mutable registry access (startup / single-thread only).
    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    /// Create a type. See [`TypeRegistry::create_type`].
    pub fn create_type(
        &mut self,
        name: &str,
        properties: Vec<PropertyDef>,
    ) -> Result<TypeIndex, TruthError> {
        self.registry.create_type(name, properties)
    }

    /// Append properties to a type and re-lay every existing snapshot of
    /// that type, back-filling the new properties with zero values.
    pub fn add_properties(&mut self, ty: TypeIndex, extra: Vec<PropertyDef>) {
        let info = self.registry.add_properties(ty, extra);
        let slots = self.slots.load_full();
        for slot in slots.iter() {
            let Some(current) = slot.snapshot.load_full() else {
                continue;
            };
            if current.type_info.index != ty {
                continue;
            }
            let mut snap = (*current).clone();
            snap.type_info = Arc::clone(&info);
            while snap.values.len() < info.properties.len() {
                let kind = info.properties[snap.values.len()].kind;
                snap.values.push(PropertyValue::default_for(kind));
            }
            slot.snapshot.store(Some(Arc::new(snap)));
            self.tombstones
                .lock()
                .expect("tombstones poisoned")
                .push(current);
        }
    }

    // -- internal plumbing --------------------------------------------------

    pub(crate) fn interner(&self) -> &StringInterner {
        &self.interner
    }

    /// The buffer store backing `Buffer` properties.
    pub fn buffers(&self) -> &BufferStore {
        &self.buffers
    }

    fn slot(&self, id: ObjectId) -> Option<Arc<ObjectSlot>> {
        if id.is_none() {
            return None;
        }
        let slots = self.slots.load();
        let slot = slots.get(id.index() as usize)?;
        if (slot.generation.load(Ordering::Acquire) & 0xffff) as u16 != id.generation() {
            return None;
        }
        Some(Arc::clone(slot))
    }

    fn allocate_slot(&self, ty: TypeIndex) -> (ObjectId, Arc<ObjectSlot>) {
        let mut alloc = self.alloc.lock().expect("slot allocator poisoned");
        let index = match alloc.free.pop_front() {
            Some(index) => index,
            None => {
                // Grow the table by doubling; publish the new table, keep the
                // spare slots on the free list.
                let current = self.slots.load_full();
                let old_len = current.len();
                let new_len = (old_len * 2).max(16);
                let mut grown = Vec::with_capacity(new_len);
                grown.extend(current.iter().cloned());
                for _ in old_len..new_len {
                    grown.push(Arc::new(ObjectSlot::new()));
                }
                self.slots.store(Arc::new(grown));
                for spare in (old_len as u32 + 1)..new_len as u32 {
                    alloc.free.push_back(spare);
                }
                old_len as u32
            }
        };
        drop(alloc);
        let slots = self.slots.load();
        let slot = Arc::clone(&slots[index as usize]);
        let generation = (slot.generation.load(Ordering::Acquire) & 0xffff) as u16;
        (ObjectId::new(ty, generation, index), slot)
    }

    /// Install `new` as the slot's current snapshot and run all commit-side
    /// bookkeeping (version tick, tombstone, undo, change tracking,
    /// ancestor version propagation).
    fn publish(&self, slot: &ObjectSlot, new: Arc<ObjectSnapshot>, scope: UndoScopeId) {
        let old = slot.snapshot.swap(Some(Arc::clone(&new)));
        slot.version.fetch_add(1, Ordering::AcqRel);
        self.after_publish(old, new, scope);
    }

    fn after_publish(
        &self,
        old: Option<Arc<ObjectSnapshot>>,
        new: Arc<ObjectSnapshot>,
        scope: UndoScopeId,
    ) {
        if scope != NO_UNDO_SCOPE {
            self.undo.record(
                scope,
                UndoAction {
                    object: new.id,
                    before: old.clone(),
                    after: Some(Arc::clone(&new)),
                },
            );
        }
        self.tracker.record(new.id);
        if self.changelog.active() {
            self.record_changelog_diff(old.as_deref(), &new);
        }
        if !new.pseudo {
            self.tick_ancestors(new.owner);
        }
        if let Some(old) = old {
            self.tombstones
                .lock()
                .expect("tombstones poisoned")
                .push(old);
        }
    }

    /// Bump version counters up the owner chain so asset roots observe
    /// subobject edits.
    fn tick_ancestors(&self, mut owner: ObjectId) {
        while owner.is_some() {
            let Some(slot) = self.slot(owner) else {
                return;
            };
            slot.version.fetch_add(1, Ordering::AcqRel);
            self.tracker.record(owner);
            match slot.snapshot.load_full() {
                Some(snap) => owner = snap.owner,
                None => return,
            }
        }
    }

    pub(crate) fn register_instance(&self, prototype: ObjectId, instance: ObjectId) {
        self.instances
            .lock()
            .expect("instances poisoned")
            .entry(prototype)
            .or_default()
            .push(instance);
    }

    pub(crate) fn unregister_instance(&self, prototype: ObjectId, instance: ObjectId) {
        let mut instances = self.instances.lock().expect("instances poisoned");
        if let Some(list) = instances.get_mut(&prototype) {
            list.retain(|&i| i != instance);
            if list.is_empty() {
                instances.remove(&prototype);
            }
        }
    }

    /// Live instances created from `prototype`.
    pub fn instances_of(&self, prototype: ObjectId) -> Vec<ObjectId> {
        self.instances
            .lock()
            .expect("instances poisoned")
            .get(&prototype)
            .cloned()
            .unwrap_or_default()
    }

    // -- creation -----------------------------------------------------------

    /// Create an object of `ty`. The new object is a clone of the type's
    /// default object if one is set, otherwise default-initialized.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range type index.
    pub fn create_object_of_type(&self, ty: TypeIndex, scope: UndoScopeId) -> ObjectId {
        let default = self.registry.default_object(ty);
        if default.is_some() {
            match self.clone_into(default, ObjectId::NONE, scope) {
                Ok(id) => return id,
                Err(err) => {
                    error!(?default, %err, "default object unreadable, creating empty object");
                }
            }
        }
        self.create_empty(ty, ObjectId::NONE, false, scope)
    }

    pub(crate) fn create_empty(
        &self,
        ty: TypeIndex,
        owner: ObjectId,
        pseudo: bool,
        scope: UndoScopeId,
    ) -> ObjectId {
        let info = self
            .registry
            .info_checked(ty)
            .unwrap_or_else(|| panic!("type index {} out of range", ty.raw()))
            .clone();
        let (id, slot) = self.allocate_slot(ty);
        let mut snap = ObjectSnapshot::new(id, info);
        snap.owner = owner;
        snap.pseudo = pseudo;
        let uuid = Uuid::new_v4();
        *slot.uuid.lock().expect("uuid poisoned") = uuid;
        self.by_uuid
            .lock()
            .expect("uuid map poisoned")
            .insert(uuid, id);
        if self.changelog.active() {
            self.record_changelog_create(id);
        }
        self.publish(&slot, Arc::new(snap), scope);
        id
    }

    /// Create an object inheriting from `prototype`.
    pub fn create_object_from_prototype(
        &self,
        prototype: ObjectId,
        scope: UndoScopeId,
    ) -> Result<ObjectId, TruthError> {
        self.create_instance(prototype, ObjectId::NONE, scope)
    }

    pub(crate) fn create_instance(
        &self,
        prototype: ObjectId,
        owner: ObjectId,
        scope: UndoScopeId,
    ) -> Result<ObjectId, TruthError> {
        let proto = self.read(prototype).ok_or(TruthError::DeadObject(prototype))?;
        let ty = proto.type_info.index;
        let info = Arc::clone(&proto.type_info);
        let (id, slot) = self.allocate_slot(ty);
        let mut snap = ObjectSnapshot::new(id, info);
        snap.owner = owner;
        snap.prototype = prototype;
        let uuid = Uuid::new_v4();
        *slot.uuid.lock().expect("uuid poisoned") = uuid;
        self.by_uuid
            .lock()
            .expect("uuid map poisoned")
            .insert(uuid, id);
        self.register_instance(prototype, id);
        if self.changelog.active() {
            self.record_changelog_create(id);
        }
        self.publish(&slot, Arc::new(snap), scope);
        Ok(id)
    }

    /// Create a transient pseudo-object. It carries an owner but is not
    /// linked into the owner's children, and committing it never ticks
    /// other objects' versions.
    pub fn create_pseudo_object_of_type(
        &self,
        ty: TypeIndex,
        owner: ObjectId,
        scope: UndoScopeId,
    ) -> ObjectId {
        self.create_empty(ty, owner, true, scope)
    }

    // -- identity -----------------------------------------------------------

    /// The persistent identifier of an object.
    pub fn uuid(&self, id: ObjectId) -> Option<Uuid> {
        let slot = self.slot(id)?;
        let uuid = *slot.uuid.lock().expect("uuid poisoned");
        Some(uuid)
    }

    /// Replace the uuid of a freshly created object (at most one commit).
    /// Ignored, with an error log, once the object has been committed to.
    pub fn set_uuid(&self, id: ObjectId, uuid: Uuid) {
        let Some(slot) = self.slot(id) else {
            warn!(?id, "set_uuid on dead object");
            return;
        };
        if slot.version.load(Ordering::Acquire) > 1 {
            error!(?id, "set_uuid is only permitted on a freshly created object");
            return;
        }
        let mut guard = slot.uuid.lock().expect("uuid poisoned");
        let mut by_uuid = self.by_uuid.lock().expect("uuid map poisoned");
        by_uuid.remove(&guard);
        by_uuid.insert(uuid, id);
        *guard = uuid;
    }

    /// Find an object by uuid, or create an empty placeholder of `ty` with
    /// that uuid. Used by deserialization to wire up forward references.
    pub fn resolve_or_create_placeholder(&self, uuid: Uuid, ty: TypeIndex) -> ObjectId {
        if let Some(&id) = self.by_uuid.lock().expect("uuid map poisoned").get(&uuid) {
            return id;
        }
        let id = self.create_empty(ty, ObjectId::NONE, false, NO_UNDO_SCOPE);
        self.set_uuid(id, uuid);
        id
    }

    // -- reads --------------------------------------------------------------

    /// Acquire the current snapshot of an object. The returned handle stays
    /// valid (and torn-free) for as long as the caller holds it. Ghost
    /// objects are readable; check [`ObjectSnapshot::is_alive`].
    pub fn read(&self, id: ObjectId) -> Option<Arc<ObjectSnapshot>> {
        self.slot(id)?.snapshot.load_full()
    }

    /// Whether `id` refers to a live object.
    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.read(id).map(|s| s.alive).unwrap_or(false)
    }

    /// The object's version counter; non-decreasing across the process
    /// lifetime, ticking on every commit including undo/redo.
    pub fn version(&self, id: ObjectId) -> u64 {
        self.slot(id)
            .map(|s| s.version.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// The type of an object, dead or alive.
    pub fn object_type(&self, id: ObjectId) -> Option<TypeIndex> {
        self.read(id).map(|s| s.type_info.index)
    }

    /// The owner of an object (`NONE` for roots).
    pub fn owner(&self, id: ObjectId) -> ObjectId {
        self.read(id).map(|s| s.owner).unwrap_or(ObjectId::NONE)
    }

    /// The prototype of an object (`NONE` if standalone).
    pub fn prototype(&self, id: ObjectId) -> ObjectId {
        self.read(id).map(|s| s.prototype).unwrap_or(ObjectId::NONE)
    }

    /// All live objects of a type. Allocates; the caller owns the result.
    pub fn objects_of_type(&self, ty: TypeIndex) -> Vec<ObjectId> {
        let slots = self.slots.load();
        let mut out = Vec::new();
        for slot in slots.iter() {
            if let Some(snap) = slot.snapshot.load_full() {
                if snap.type_info.index == ty && snap.alive {
                    out.push(snap.id);
                }
            }
        }
        out
    }

    // -- writes -------------------------------------------------------------

    /// Obtain a private mutable copy of the object for editing.
    pub fn write(&self, id: ObjectId) -> Result<ObjectWriter, TruthError> {
        let slot = self.slot(id).ok_or(TruthError::DeadObject(id))?;
        let original = slot
            .snapshot
            .load_full()
            .ok_or(TruthError::DeadObject(id))?;
        if self.overlap_detection {
            slot.writers.fetch_add(1, Ordering::AcqRel);
        }
        Ok(ObjectWriter {
            id,
            snap: (*original).clone(),
            original,
        })
    }

    /// Publish a writer's snapshot as the object's current value.
    ///
    /// A commit on a destroyed slot is discarded with a warning. With
    /// `scope != 0` the (before, after) pair is appended to that undo
    /// scope.
    pub fn commit(&self, writer: ObjectWriter, scope: UndoScopeId) {
        let Some(slot) = self.slot(writer.id) else {
            warn!(id = ?writer.id, "commit on destroyed slot discarded");
            return;
        };
        if self.overlap_detection {
            let outstanding = slot.writers.fetch_sub(1, Ordering::AcqRel);
            if outstanding > 1 {
                error!(
                    id = ?writer.id,
                    outstanding,
                    "overlapping writes detected at commit"
                );
            }
        }
        if slot.snapshot.load_full().is_none() {
            warn!(id = ?writer.id, "commit on destroyed slot discarded");
            return;
        }
        self.publish(&slot, Arc::new(writer.snap), scope);
    }

    /// Optimistic variant of [`write`](Truth::write); pair with
    /// [`try_commit`](Truth::try_commit).
    pub fn try_write(&self, id: ObjectId) -> Result<ObjectWriter, TruthError> {
        self.write(id)
    }

    /// Publish only if the object has not changed since
    /// [`try_write`](Truth::try_write). Returns `false` (discarding the
    /// write) on contention; no undo entry is recorded for a failed
    /// publish.
    pub fn try_commit(&self, writer: ObjectWriter, scope: UndoScopeId) -> bool {
        let Some(slot) = self.slot(writer.id) else {
            warn!(id = ?writer.id, "try_commit on destroyed slot discarded");
            return false;
        };
        if self.overlap_detection {
            slot.writers.fetch_sub(1, Ordering::AcqRel);
        }
        let current = Some(Arc::clone(&writer.original));
        let new = Arc::new(writer.snap);
        let previous = slot
            .snapshot
            .compare_and_swap(&current, Some(Arc::clone(&new)));
        let swapped = match &*previous {
            Some(prev) => Arc::ptr_eq(prev, &writer.original),
            None => false,
        };
        if !swapped {
            return false;
        }
        slot.version.fetch_add(1, Ordering::AcqRel);
        self.after_publish(Some(writer.original), new, scope);
        true
    }

    /// Redirect a prepared snapshot to a different slot before commit.
    pub fn retarget_write(
        &self,
        writer: &mut ObjectWriter,
        new_id: ObjectId,
    ) -> Result<(), TruthError> {
        let slot = self.slot(new_id).ok_or(TruthError::DeadObject(new_id))?;
        let original = slot
            .snapshot
            .load_full()
            .ok_or(TruthError::DeadObject(new_id))?;
        writer.id = new_id;
        writer.snap.id = new_id;
        writer.original = original;
        Ok(())
    }

    /// Abandon a writer without publishing.
    pub fn cancel_write(&self, writer: ObjectWriter) {
        if self.overlap_detection {
            if let Some(slot) = self.slot(writer.id) {
                slot.writers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    // -- clone / destroy ----------------------------------------------------

    /// Deep-copy an object: subobjects are cloned recursively, references
    /// are shared, and the clone has no prototype link.
    pub fn clone_object(&self, id: ObjectId, scope: UndoScopeId) -> Result<ObjectId, TruthError> {
        self.clone_into(id, ObjectId::NONE, scope)
    }

    pub(crate) fn clone_into(
        &self,
        src: ObjectId,
        owner: ObjectId,
        scope: UndoScopeId,
    ) -> Result<ObjectId, TruthError> {
        let src_snap = self.read(src).ok_or(TruthError::DeadObject(src))?;
        let info = Arc::clone(&src_snap.type_info);
        let (id, slot) = self.allocate_slot(info.index);
        let mut snap = ObjectSnapshot::new(id, Arc::clone(&info));
        snap.owner = owner;
        for property in 0..info.properties.len() as u32 {
            let value = match self.resolve_value(src, property)? {
                PropertyValue::Subobject(child) if child.is_some() => {
                    PropertyValue::Subobject(self.clone_into(child, id, scope)?)
                }
                PropertyValue::SubobjectSet(_) => {
                    let mut cloned = crate::object::SetDelta::default();
                    for child in self.get_subobject_set(src, property) {
                        cloned.added.push(self.clone_into(child, id, scope)?);
                    }
                    PropertyValue::SubobjectSet(cloned)
                }
                PropertyValue::ReferenceSet(_) => {
                    let mut refs = crate::object::SetDelta::default();
                    refs.added = self.get_reference_set(src, property);
                    PropertyValue::ReferenceSet(refs)
                }
                other => other,
            };
            snap.set_local_value(property, value);
        }
        let uuid = Uuid::new_v4();
        *slot.uuid.lock().expect("uuid poisoned") = uuid;
        self.by_uuid
            .lock()
            .expect("uuid map poisoned")
            .insert(uuid, id);
        if self.changelog.active() {
            self.record_changelog_create(id);
        }
        self.publish(&slot, Arc::new(snap), scope);
        Ok(id)
    }

    /// Destroy an object and (recursively) its owned subobjects. If other
    /// objects still use it as a prototype it becomes a ghost: readable,
    /// `is_alive == false`, reclaimed once the last instance lets go.
    ///
    /// Destroys recorded under an undo scope keep their slot until the
    /// scope can no longer revive them; only unscoped destroys are queued
    /// for reclamation at the next [`garbage_collect`](Truth::garbage_collect).
    pub fn destroy_object(&self, id: ObjectId, scope: UndoScopeId) {
        let Some(snap) = self.read(id) else {
            warn!(?id, "destroy of dead object ignored");
            return;
        };
        if !snap.alive {
            return;
        }
        // Owned subobjects go down with the object.
        for (index, _) in snap.type_info.properties.iter().enumerate() {
            let property = index as u32;
            match snap.local_value(property) {
                Some(PropertyValue::Subobject(child)) if child.is_some() => {
                    self.destroy_object(*child, scope);
                }
                Some(PropertyValue::SubobjectSet(delta)) => {
                    for &child in delta.added.iter().chain(delta.instantiated.iter()) {
                        self.destroy_object(child, scope);
                    }
                }
                _ => {}
            }
        }
        if snap.prototype.is_some() {
            self.unregister_instance(snap.prototype, id);
        }
        let Some(slot) = self.slot(id) else {
            return;
        };
        let mut dead = (*snap).clone();
        dead.alive = false;
        if self.changelog.active() {
            self.changelog.push(crate::changes::ChangeOp::Destroy {
                object: id.to_raw(),
            });
        }
        self.publish(&slot, Arc::new(dead), scope);
        if scope == NO_UNDO_SCOPE {
            self.pending_reclaim
                .lock()
                .expect("pending reclaim poisoned")
                .push(id);
        }
    }

    // -- garbage collection -------------------------------------------------

    /// Reclaim tombstoned snapshots and recycle destroyed slots. Must run
    /// at a serial safe point; the `&mut self` receiver enforces that no
    /// other store operation is in flight.
    pub fn garbage_collect(&mut self) {
        self.tombstones
            .get_mut()
            .expect("tombstones poisoned")
            .clear();

        let pending = std::mem::take(
            &mut *self
                .pending_reclaim
                .get_mut()
                .expect("pending reclaim poisoned"),
        );
        let mut still_pending = Vec::new();
        for id in pending {
            let Some(slot) = self.slot(id) else {
                continue;
            };
            let Some(snap) = slot.snapshot.load_full() else {
                continue;
            };
            if snap.alive {
                // Revived (undo); drop the reclaim request.
                continue;
            }
            let has_instances = !self.instances_of(id).is_empty();
            if has_instances {
                // Ghost prototype: keep until the last instance detaches.
                still_pending.push(id);
                continue;
            }
            let uuid = *slot.uuid.lock().expect("uuid poisoned");
            self.by_uuid
                .get_mut()
                .expect("uuid map poisoned")
                .remove(&uuid);
            slot.snapshot.store(None);
            slot.generation.fetch_add(1, Ordering::AcqRel);
            self.alloc
                .get_mut()
                .expect("slot allocator poisoned")
                .free
                .push_back(id.index());
        }
        *self
            .pending_reclaim
            .get_mut()
            .expect("pending reclaim poisoned") = still_pending;
    }

    /// Queue a ghost for reclamation once its instance count reaches zero.
    pub(crate) fn queue_reclaim(&self, id: ObjectId) {
        self.pending_reclaim
            .lock()
            .expect("pending reclaim poisoned")
            .push(id);
    }

    // -- change tracking ----------------------------------------------------

    /// Objects of `ty` modified since tracker version `since`. See
    /// [`ChangedObjects`].
    pub fn changed_objects(&self, ty: TypeIndex, since: u64) -> ChangedObjects {
        self.tracker.changed_objects(ty, since)
    }

    /// The current tracker version, for use as the next `since`.
    pub fn tracker_version(&self) -> u64 {
        self.tracker.version()
    }

    // -- undo ---------------------------------------------------------------

    /// Create an undo scope. Tokens are monotone and non-zero.
    pub fn create_undo_scope(&self, name: &str) -> UndoScopeId {
        self.undo.create_scope(name, false)
    }

    /// Create an undo scope that may be appended to from multiple threads.
    pub fn create_thread_safe_undo_scope(&self, name: &str) -> UndoScopeId {
        self.undo.create_scope(name, true)
    }

    /// Re-publish every action's `before` snapshot, in reverse order.
    pub fn undo(&self, scope: UndoScopeId) {
        let actions = self.undo.actions(scope);
        for action in actions.iter().rev() {
            self.apply_undo_state(action.object, action.before.as_ref());
        }
    }

    /// Re-publish every action's `after` snapshot, in order.
    pub fn redo(&self, scope: UndoScopeId) {
        let actions = self.undo.actions(scope);
        for action in actions.iter() {
            self.apply_undo_state(action.object, action.after.as_ref());
        }
    }

    /// The recorded actions of a scope (for UI/inspection).
    pub fn undo_scope_actions(&self, scope: UndoScopeId) -> Vec<UndoAction> {
        self.undo.actions(scope)
    }

    /// The distinct objects touched by a scope.
    pub fn undo_scope_objects(&self, scope: UndoScopeId) -> Vec<ObjectId> {
        self.undo.objects(scope)
    }

    fn apply_undo_state(&self, id: ObjectId, target: Option<&Arc<ObjectSnapshot>>) {
        let Some(slot) = self.slot(id) else {
            warn!(?id, "undo target slot no longer exists");
            return;
        };
        let new = match target {
            Some(snap) => Arc::clone(snap),
            None => {
                // The object did not exist at this point: ghost it.
                let Some(current) = slot.snapshot.load_full() else {
                    return;
                };
                let mut dead = (*current).clone();
                dead.alive = false;
                Arc::new(dead)
            }
        };
        self.publish(&slot, new, NO_UNDO_SCOPE);
    }
}
