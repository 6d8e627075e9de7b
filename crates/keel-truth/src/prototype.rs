//! Property access and prototype inheritance.
//!
//! Reads resolve through the prototype chain: a locally overridden property
//! wins, otherwise the prototype's effective value is used, otherwise the
//! type's default. Set-valued properties merge top-down along the chain:
//! the prototype's effective set, minus local removals, with local
//! instantiations substituted, plus local additions.
//!
//! Typed getters return the value directly (with the kind's zero value on
//! misuse, which is logged); setters operate on an [`ObjectWriter`] and
//! take effect at commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{error, warn};

use crate::buffers::BufferRef;
use crate::object::{ObjectId, PropertyValue, SetDelta};
use crate::store::{ObjectWriter, Truth};
use crate::types::PropertyKind;
use crate::undo::UndoScopeId;
use crate::TruthError;

fn writer_kind_ok(writer: &ObjectWriter, property: u32, kind: PropertyKind) -> bool {
    match writer.snapshot().type_info().property(property) {
        Some(def) if def.kind == kind => true,
        Some(def) => {
            error!(
                id = ?writer.id(),
                property,
                expected = ?kind,
                actual = ?def.kind,
                "property kind mismatch, set ignored"
            );
            false
        }
        None => {
            error!(id = ?writer.id(), property, "property index out of range, set ignored");
            false
        }
    }
}

impl Truth {
    // -- resolution ---------------------------------------------------------

    /// The effective value of a property: local override, else prototype,
    /// else type default. Set-valued properties return the *local delta*;
    /// use [`get_reference_set`](Truth::get_reference_set) /
    /// [`get_subobject_set`](Truth::get_subobject_set) for the merged view.
    pub(crate) fn resolve_value(
        &self,
        id: ObjectId,
        property: u32,
    ) -> Result<PropertyValue, TruthError> {
        let snap = self.read(id).ok_or(TruthError::DeadObject(id))?;
        let def = snap
            .type_info()
            .property(property)
            .ok_or(TruthError::UnknownProperty {
                type_name: snap.type_info().name.clone(),
                property,
            })?;
        let local = snap
            .local_value(property)
            .cloned()
            .expect("values match property table");
        match def.kind {
            PropertyKind::ReferenceSet | PropertyKind::SubobjectSet => Ok(local),
            _ => {
                if snap.is_overridden(property) {
                    Ok(local)
                } else if snap.prototype().is_some() {
                    self.resolve_value(snap.prototype(), property)
                } else {
                    Ok(PropertyValue::default_for(def.kind))
                }
            }
        }
    }

    /// Whether the property is locally overridden on `id`.
    pub fn is_overridden(&self, id: ObjectId, property: u32) -> bool {
        self.read(id)
            .map(|s| s.is_overridden(property))
            .unwrap_or(false)
    }

    // -- typed getters ------------------------------------------------------

    pub fn get_bool(&self, id: ObjectId, property: u32) -> bool {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::Bool(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), false),
            Err(err) => unreadable(id, property, err, false),
        }
    }

    pub fn get_u32(&self, id: ObjectId, property: u32) -> u32 {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::U32(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), 0),
            Err(err) => unreadable(id, property, err, 0),
        }
    }

    pub fn get_u64(&self, id: ObjectId, property: u32) -> u64 {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::U64(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), 0),
            Err(err) => unreadable(id, property, err, 0),
        }
    }

    pub fn get_f32(&self, id: ObjectId, property: u32) -> f32 {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::F32(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), 0.0),
            Err(err) => unreadable(id, property, err, 0.0),
        }
    }

    pub fn get_f64(&self, id: ObjectId, property: u32) -> f64 {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::F64(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), 0.0),
            Err(err) => unreadable(id, property, err, 0.0),
        }
    }

    pub fn get_string(&self, id: ObjectId, property: u32) -> Arc<str> {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::Str(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), Arc::from("")),
            Err(err) => unreadable(id, property, err, Arc::from("")),
        }
    }

    pub fn get_buffer(&self, id: ObjectId, property: u32) -> Option<BufferRef> {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::Buffer(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), None),
            Err(err) => unreadable(id, property, err, None),
        }
    }

    pub fn get_reference(&self, id: ObjectId, property: u32) -> ObjectId {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::Reference(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), ObjectId::NONE),
            Err(err) => unreadable(id, property, err, ObjectId::NONE),
        }
    }

    /// The effective subobject: local if overridden, else the prototype's.
    pub fn get_subobject(&self, id: ObjectId, property: u32) -> ObjectId {
        match self.resolve_value(id, property) {
            Ok(PropertyValue::Subobject(v)) => v,
            Ok(other) => kind_mismatch(id, property, other.kind(), ObjectId::NONE),
            Err(err) => unreadable(id, property, err, ObjectId::NONE),
        }
    }

    /// The merged effective reference set. Deduplicated; element order is
    /// stable between calls (prototype order first, then local additions).
    pub fn get_reference_set(&self, id: ObjectId, property: u32) -> Vec<ObjectId> {
        self.effective_set(id, property)
    }

    /// The merged effective subobject set; see
    /// [`get_reference_set`](Truth::get_reference_set) for ordering.
    pub fn get_subobject_set(&self, id: ObjectId, property: u32) -> Vec<ObjectId> {
        self.effective_set(id, property)
    }

    fn effective_set(&self, id: ObjectId, property: u32) -> Vec<ObjectId> {
        let Some(snap) = self.read(id) else {
            return Vec::new();
        };
        let mut out = if snap.prototype().is_some() {
            self.effective_set(snap.prototype(), property)
        } else {
            Vec::new()
        };
        if let Some(delta) = snap.set_delta(property) {
            out.retain(|e| !delta.removed.contains(e));
            for &inst in &delta.instantiated {
                let parent = self.prototype(inst);
                match out.iter().position(|&e| e == parent) {
                    Some(pos) => out[pos] = inst,
                    // Parent element no longer visible; keep the instance.
                    None => out.push(inst),
                }
            }
            out.extend_from_slice(&delta.added);
        }
        let mut seen = HashSet::with_capacity(out.len());
        out.retain(|e| seen.insert(*e));
        out
    }

    // -- typed setters ------------------------------------------------------

    pub fn set_bool(&self, w: &mut ObjectWriter, property: u32, value: bool) {
        if writer_kind_ok(w, property, PropertyKind::Bool) {
            w.snap.set_local_value(property, PropertyValue::Bool(value));
        }
    }

    pub fn set_u32(&self, w: &mut ObjectWriter, property: u32, value: u32) {
        if writer_kind_ok(w, property, PropertyKind::U32) {
            w.snap.set_local_value(property, PropertyValue::U32(value));
        }
    }

    pub fn set_u64(&self, w: &mut ObjectWriter, property: u32, value: u64) {
        if writer_kind_ok(w, property, PropertyKind::U64) {
            w.snap.set_local_value(property, PropertyValue::U64(value));
        }
    }

    pub fn set_f32(&self, w: &mut ObjectWriter, property: u32, value: f32) {
        if writer_kind_ok(w, property, PropertyKind::F32) {
            w.snap.set_local_value(property, PropertyValue::F32(value));
        }
    }

    pub fn set_f64(&self, w: &mut ObjectWriter, property: u32, value: f64) {
        if writer_kind_ok(w, property, PropertyKind::F64) {
            w.snap.set_local_value(property, PropertyValue::F64(value));
        }
    }

    pub fn set_string(&self, w: &mut ObjectWriter, property: u32, value: &str) {
        if writer_kind_ok(w, property, PropertyKind::Str) {
            let interned = self.interner().intern(value);
            w.snap.set_local_value(property, PropertyValue::Str(interned));
        }
    }

    /// Set a buffer property. Ownership of the caller's reference transfers
    /// to the object.
    pub fn set_buffer(&self, w: &mut ObjectWriter, property: u32, value: Option<BufferRef>) {
        if writer_kind_ok(w, property, PropertyKind::Buffer) {
            w.snap.set_local_value(property, PropertyValue::Buffer(value));
        }
    }

    pub fn set_reference(&self, w: &mut ObjectWriter, property: u32, target: ObjectId) {
        if writer_kind_ok(w, property, PropertyKind::Reference) {
            w.snap
                .set_local_value(property, PropertyValue::Reference(target));
        }
    }

    /// Set a subobject. The child is re-owned by the written object (its
    /// `owner` is committed immediately).
    pub fn set_subobject(&self, w: &mut ObjectWriter, property: u32, child: ObjectId) {
        if !writer_kind_ok(w, property, PropertyKind::Subobject) {
            return;
        }
        if child.is_some() {
            self.set_owner(child, w.id());
        }
        w.snap
            .set_local_value(property, PropertyValue::Subobject(child));
    }

    /// Remove the local override so the property resolves through the
    /// prototype (or to the default) again.
    pub fn clear_override(&self, w: &mut ObjectWriter, property: u32) {
        if w.snapshot().type_info().property(property).is_some() {
            w.snap.clear_override(property);
        }
    }

    fn set_owner(&self, child: ObjectId, owner: ObjectId) {
        match self.write(child) {
            Ok(mut cw) => {
                cw.snap.owner = owner;
                self.commit(cw, crate::undo::NO_UNDO_SCOPE);
            }
            Err(err) => warn!(?child, %err, "cannot re-own dead subobject"),
        }
    }

    // -- set mutation -------------------------------------------------------

    /// Add elements to a local reference set.
    pub fn add_to_reference_set(&self, w: &mut ObjectWriter, property: u32, items: &[ObjectId]) {
        if !writer_kind_ok(w, property, PropertyKind::ReferenceSet) {
            return;
        }
        let delta = w.snap.set_delta_mut(property).expect("kind checked");
        for &item in items {
            if !delta.added.contains(&item) {
                delta.added.push(item);
            }
            delta.removed.retain(|&r| r != item);
        }
    }

    /// Remove elements from a reference set. Locally added elements are
    /// dropped; inherited elements are recorded as removed.
    pub fn remove_from_reference_set(
        &self,
        w: &mut ObjectWriter,
        property: u32,
        items: &[ObjectId],
    ) {
        if !writer_kind_ok(w, property, PropertyKind::ReferenceSet) {
            return;
        }
        let delta = w.snap.set_delta_mut(property).expect("kind checked");
        for &item in items {
            if let Some(pos) = delta.added.iter().position(|&a| a == item) {
                delta.added.remove(pos);
            } else if !delta.removed.contains(&item) {
                delta.removed.push(item);
            }
        }
    }

    /// Add owned children to a local subobject set. Children are re-owned
    /// by the written object.
    pub fn add_to_subobject_set(&self, w: &mut ObjectWriter, property: u32, children: &[ObjectId]) {
        if !writer_kind_ok(w, property, PropertyKind::SubobjectSet) {
            return;
        }
        for &child in children {
            self.set_owner(child, w.id());
        }
        let delta = w.snap.set_delta_mut(property).expect("kind checked");
        for &child in children {
            if !delta.added.contains(&child) {
                delta.added.push(child);
            }
        }
    }

    /// Remove children from a subobject set. Locally added or instantiated
    /// children are destroyed; inherited elements are recorded as removed.
    pub fn remove_from_subobject_set(
        &self,
        w: &mut ObjectWriter,
        property: u32,
        children: &[ObjectId],
        scope: UndoScopeId,
    ) {
        if !writer_kind_ok(w, property, PropertyKind::SubobjectSet) {
            return;
        }
        let mut to_destroy = Vec::new();
        {
            let delta = w.snap.set_delta_mut(property).expect("kind checked");
            for &child in children {
                if let Some(pos) = delta.added.iter().position(|&a| a == child) {
                    delta.added.remove(pos);
                    to_destroy.push(child);
                } else if let Some(pos) = delta.instantiated.iter().position(|&i| i == child) {
                    delta.instantiated.remove(pos);
                    to_destroy.push(child);
                } else if !delta.removed.contains(&child) {
                    delta.removed.push(child);
                }
            }
        }
        for child in to_destroy {
            self.destroy_object(child, scope);
        }
    }

    // -- prototype set operations (commit internally) -----------------------

    /// Record an inherited subobject-set element as removed.
    pub fn remove_from_prototype_subobject_set(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        self.prototype_set_remove(owner, property, item, PropertyKind::SubobjectSet, scope)
    }

    /// Undo a [`remove_from_prototype_subobject_set`](Self::remove_from_prototype_subobject_set).
    pub fn cancel_remove_from_prototype_subobject_set(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        self.prototype_set_cancel_remove(owner, property, item, PropertyKind::SubobjectSet, scope)
    }

    /// Record an inherited reference-set element as removed.
    pub fn remove_from_prototype_reference_set(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        self.prototype_set_remove(owner, property, item, PropertyKind::ReferenceSet, scope)
    }

    /// Undo a [`remove_from_prototype_reference_set`](Self::remove_from_prototype_reference_set).
    pub fn cancel_remove_from_prototype_reference_set(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        self.prototype_set_cancel_remove(owner, property, item, PropertyKind::ReferenceSet, scope)
    }

    fn prototype_set_remove(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        kind: PropertyKind,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let mut w = self.write(owner)?;
        if !writer_kind_ok(&w, property, kind) {
            self.cancel_write(w);
            return Ok(());
        }
        let delta = w.snap.set_delta_mut(property).expect("kind checked");
        if !delta.removed.contains(&item) {
            delta.removed.push(item);
        }
        self.commit(w, scope);
        Ok(())
    }

    fn prototype_set_cancel_remove(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        kind: PropertyKind,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let mut w = self.write(owner)?;
        if !writer_kind_ok(&w, property, kind) {
            self.cancel_write(w);
            return Ok(());
        }
        let delta = w.snap.set_delta_mut(property).expect("kind checked");
        delta.removed.retain(|&r| r != item);
        self.commit(w, scope);
        Ok(())
    }

    // -- instantiation ------------------------------------------------------

    /// Locally instantiate the inherited subobject at `property`: a new
    /// object whose prototype is the prototype chain's effective subobject.
    pub fn instantiate_subobject(
        &self,
        owner: ObjectId,
        property: u32,
        scope: UndoScopeId,
    ) -> Result<ObjectId, TruthError> {
        let snap = self.read(owner).ok_or(TruthError::DeadObject(owner))?;
        let proto = snap.prototype();
        if proto.is_none() {
            return Err(TruthError::NoPrototype(owner));
        }
        if snap.is_overridden(property) {
            if let Some(PropertyValue::Subobject(existing)) = snap.local_value(property) {
                if existing.is_some() {
                    return Ok(*existing);
                }
            }
        }
        let inherited = self.get_subobject(proto, property);
        if inherited.is_none() {
            return Err(TruthError::MissingPrototypeSubobject {
                object: owner,
                property,
            });
        }
        let inst = self.create_instance(inherited, owner, scope)?;
        let mut w = self.write(owner)?;
        w.snap
            .set_local_value(property, PropertyValue::Subobject(inst));
        self.commit(w, scope);
        Ok(inst)
    }

    /// Locally instantiate an inherited element of a subobject set. `item`
    /// may be an element of any ancestor layer; intermediate layers are
    /// instantiated as needed so every instance's prototype is the
    /// corresponding element of the *direct* prototype.
    pub fn instantiate_subobject_from_set(
        &self,
        owner: ObjectId,
        property: u32,
        item: ObjectId,
        scope: UndoScopeId,
    ) -> Result<ObjectId, TruthError> {
        let snap = self.read(owner).ok_or(TruthError::DeadObject(owner))?;
        if let Some(delta) = snap.set_delta(property) {
            if delta.added.contains(&item) {
                // Already a local element.
                return Ok(item);
            }
            for &inst in &delta.instantiated {
                if inst == item || self.prototype_chain_contains(inst, item) {
                    return Ok(inst);
                }
            }
        }
        let proto = snap.prototype();
        if proto.is_none() {
            return Err(TruthError::NoPrototype(owner));
        }
        let proto_set = self.get_subobject_set(proto, property);
        let Some(&elem) = proto_set
            .iter()
            .find(|&&e| e == item || self.prototype_chain_contains(e, item))
        else {
            return Err(TruthError::MissingPrototypeSubobject {
                object: owner,
                property,
            });
        };
        // The instance's prototype must be local to the direct prototype.
        let proto_snap = self.read(proto).ok_or(TruthError::DeadObject(proto))?;
        let elem_is_local = proto_snap
            .set_delta(property)
            .map(|d| d.added.contains(&elem) || d.instantiated.contains(&elem))
            .unwrap_or(false);
        let parent = if elem_is_local {
            elem
        } else {
            self.instantiate_subobject_from_set(proto, property, elem, scope)?
        };
        let inst = self.create_instance(parent, owner, scope)?;
        let mut w = self.write(owner)?;
        if !writer_kind_ok(&w, property, PropertyKind::SubobjectSet) {
            self.cancel_write(w);
            self.destroy_object(inst, scope);
            return Err(TruthError::UnknownProperty {
                type_name: snap.type_info().name.clone(),
                property,
            });
        }
        w.snap
            .set_delta_mut(property)
            .expect("kind checked")
            .instantiated
            .push(inst);
        self.commit(w, scope);
        Ok(inst)
    }

    fn prototype_chain_contains(&self, obj: ObjectId, ancestor: ObjectId) -> bool {
        let mut current = self.prototype(obj);
        while current.is_some() {
            if current == ancestor {
                return true;
            }
            current = self.prototype(current);
        }
        false
    }

    // -- propagation --------------------------------------------------------

    /// Push the local override of `property` into the prototype, then clear
    /// the local override.
    pub fn propagate_property(
        &self,
        obj: ObjectId,
        property: u32,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let snap = self.read(obj).ok_or(TruthError::DeadObject(obj))?;
        let proto = snap.prototype();
        if proto.is_none() {
            return Err(TruthError::NoPrototype(obj));
        }
        let def = snap
            .type_info()
            .property(property)
            .ok_or(TruthError::UnknownProperty {
                type_name: snap.type_info().name.clone(),
                property,
            })?;
        match def.kind {
            PropertyKind::ReferenceSet | PropertyKind::SubobjectSet => {
                self.propagate_set(obj, proto, property, def.kind, scope)
            }
            PropertyKind::Subobject => {
                if !snap.is_overridden(property) {
                    return Ok(());
                }
                let child = match snap.local_value(property) {
                    Some(PropertyValue::Subobject(c)) => *c,
                    _ => ObjectId::NONE,
                };
                if child.is_some() && self.prototype(child) == self.get_subobject(proto, property)
                {
                    // Instantiated child: push its overrides into the
                    // prototype's element instead of moving it.
                    self.propagate_object(child, &[], scope)?;
                    return Ok(());
                }
                // Move the local child to the prototype.
                if child.is_some() {
                    self.set_owner(child, proto);
                }
                let mut pw = self.write(proto)?;
                pw.snap
                    .set_local_value(property, PropertyValue::Subobject(child));
                self.commit(pw, scope);
                let mut w = self.write(obj)?;
                w.snap.clear_override(property);
                self.commit(w, scope);
                Ok(())
            }
            _ => {
                if !snap.is_overridden(property) {
                    return Ok(());
                }
                let value = snap
                    .local_value(property)
                    .cloned()
                    .expect("values match property table");
                let mut pw = self.write(proto)?;
                pw.snap.set_local_value(property, value);
                self.commit(pw, scope);
                let mut w = self.write(obj)?;
                w.snap.clear_override(property);
                self.commit(w, scope);
                Ok(())
            }
        }
    }

    fn propagate_set(
        &self,
        obj: ObjectId,
        proto: ObjectId,
        property: u32,
        kind: PropertyKind,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let snap = self.read(obj).ok_or(TruthError::DeadObject(obj))?;
        let delta = snap.set_delta(property).cloned().unwrap_or_default();
        if delta.is_empty() {
            return Ok(());
        }
        // Instantiated elements first: their overrides flow into the
        // prototype's corresponding elements, then the instances collapse
        // back to plain inheritance.
        for &inst in &delta.instantiated {
            self.propagate_object(inst, &[], scope)?;
        }
        let mut pw = self.write(proto)?;
        {
            let pd = pw.snap.set_delta_mut(property).expect("set property");
            for &added in &delta.added {
                if !pd.added.contains(&added) {
                    pd.added.push(added);
                }
            }
            for &removed in &delta.removed {
                if let Some(pos) = pd.added.iter().position(|&a| a == removed) {
                    pd.added.remove(pos);
                } else if !pd.removed.contains(&removed) {
                    pd.removed.push(removed);
                }
            }
        }
        if kind == PropertyKind::SubobjectSet {
            for &added in &delta.added {
                self.set_owner(added, proto);
            }
        }
        self.commit(pw, scope);

        let mut w = self.write(obj)?;
        {
            let d = w.snap.set_delta_mut(property).expect("set property");
            d.added.clear();
            d.removed.clear();
        }
        self.commit(w, scope);
        Ok(())
    }

    /// Push every local override of `obj` into its prototype, recursing
    /// into subobjects except those listed in `skip`.
    pub fn propagate_object(
        &self,
        obj: ObjectId,
        skip: &[ObjectId],
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let snap = self.read(obj).ok_or(TruthError::DeadObject(obj))?;
        if snap.prototype().is_none() {
            return Err(TruthError::NoPrototype(obj));
        }
        let property_count = snap.type_info().properties.len() as u32;
        for property in 0..property_count {
            let def = snap.type_info().property(property).expect("in range");
            match def.kind {
                PropertyKind::Subobject => {
                    if !snap.is_overridden(property) {
                        continue;
                    }
                    if let Some(PropertyValue::Subobject(child)) = snap.local_value(property) {
                        if skip.contains(child) {
                            continue;
                        }
                    }
                    self.propagate_property(obj, property, scope)?;
                }
                PropertyKind::ReferenceSet | PropertyKind::SubobjectSet => {
                    self.propagate_property(obj, property, scope)?;
                }
                _ => {
                    if snap.is_overridden(property) {
                        self.propagate_property(obj, property, scope)?;
                    }
                }
            }
        }
        Ok(())
    }

    // -- detach -------------------------------------------------------------

    /// Materialize all inherited values locally and sever the prototype
    /// link.
    pub fn detach_from_prototype(
        &self,
        obj: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        self.detach_from_prototype_with_lookup(obj, &HashMap::new(), scope)
    }

    /// [`detach_from_prototype`](Self::detach_from_prototype) with a remap
    /// applied to reference properties, so references to prototype-side
    /// objects can be redirected to their local instances.
    pub fn detach_from_prototype_with_lookup(
        &self,
        obj: ObjectId,
        lookup: &HashMap<ObjectId, ObjectId>,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let snap = self.read(obj).ok_or(TruthError::DeadObject(obj))?;
        let proto = snap.prototype();
        if proto.is_none() {
            return Ok(());
        }
        let mut w = self.write(obj)?;
        let property_count = snap.type_info().properties.len() as u32;
        for property in 0..property_count {
            let def = snap.type_info().property(property).expect("in range");
            match def.kind {
                PropertyKind::Reference => {
                    let mut target = self.get_reference(obj, property);
                    if let Some(&mapped) = lookup.get(&target) {
                        target = mapped;
                    }
                    w.snap
                        .set_local_value(property, PropertyValue::Reference(target));
                }
                PropertyKind::Subobject => {
                    if snap.is_overridden(property) {
                        // An instantiated child still points into the
                        // prototype's subtree; detach it as well.
                        if let Some(PropertyValue::Subobject(child)) = snap.local_value(property) {
                            if child.is_some() && self.prototype(*child).is_some() {
                                self.detach_from_prototype_with_lookup(*child, lookup, scope)?;
                            }
                        }
                        continue;
                    }
                    let inherited = self.get_subobject(obj, property);
                    if inherited.is_some() {
                        let local = self.clone_into(inherited, obj, scope)?;
                        w.snap
                            .set_local_value(property, PropertyValue::Subobject(local));
                    }
                }
                PropertyKind::ReferenceSet => {
                    let mut effective = self.get_reference_set(obj, property);
                    for target in effective.iter_mut() {
                        if let Some(&mapped) = lookup.get(target) {
                            *target = mapped;
                        }
                    }
                    w.snap.set_local_value(
                        property,
                        PropertyValue::ReferenceSet(SetDelta {
                            added: effective,
                            ..SetDelta::default()
                        }),
                    );
                }
                PropertyKind::SubobjectSet => {
                    let effective = self.get_subobject_set(obj, property);
                    let local = snap.set_delta(property).cloned().unwrap_or_default();
                    let mut added = Vec::with_capacity(effective.len());
                    for element in effective {
                        let is_local = local.added.contains(&element)
                            || local.instantiated.contains(&element);
                        if is_local {
                            if self.prototype(element).is_some() {
                                self.detach_from_prototype_with_lookup(element, lookup, scope)?;
                            }
                            added.push(element);
                        } else {
                            added.push(self.clone_into(element, obj, scope)?);
                        }
                    }
                    w.snap.set_local_value(
                        property,
                        PropertyValue::SubobjectSet(SetDelta {
                            added,
                            ..SetDelta::default()
                        }),
                    );
                }
                _ => {
                    if !snap.is_overridden(property) {
                        let value = self.resolve_value(obj, property)?;
                        w.snap.set_local_value(property, value);
                    }
                }
            }
        }
        w.snap.prototype = ObjectId::NONE;
        self.commit(w, scope);
        self.unregister_instance(proto, obj);
        if !self.is_alive(proto) && self.instances_of(proto).is_empty() {
            self.queue_reclaim(proto);
        }
        Ok(())
    }

    /// Detach every live instance of `prototype`.
    pub fn detach_all_instances(&self, prototype: ObjectId, scope: UndoScopeId) {
        for instance in self.instances_of(prototype) {
            if let Err(err) = self.detach_from_prototype(instance, scope) {
                warn!(?instance, %err, "instance could not be detached");
            }
        }
    }

    // -- pseudo-objects -----------------------------------------------------

    /// Flag an object as a transient pseudo-object: it keeps its owner but
    /// is not part of the owner's children, and its commits do not tick
    /// ancestor versions.
    pub fn convert_to_pseudo_object(
        &self,
        id: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let mut w = self.write(id)?;
        w.snap.pseudo = true;
        self.commit(w, scope);
        Ok(())
    }

    /// Reverse a [`convert_to_pseudo_object`](Self::convert_to_pseudo_object).
    pub fn convert_pseudo_object_back_to_regular_object(
        &self,
        id: ObjectId,
        scope: UndoScopeId,
    ) -> Result<(), TruthError> {
        let mut w = self.write(id)?;
        w.snap.pseudo = false;
        self.commit(w, scope);
        Ok(())
    }
}

fn kind_mismatch<T>(id: ObjectId, property: u32, actual: PropertyKind, default: T) -> T {
    error!(?id, property, ?actual, "property kind mismatch");
    default
}

fn unreadable<T>(id: ObjectId, property: u32, err: TruthError, default: T) -> T {
    warn!(?id, property, %err, "property read on unreadable object");
    default
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Truth;
    use crate::types::{PropertyDef, TypeIndex};
    use crate::undo::NO_UNDO_SCOPE;

    fn setup() -> (Truth, TypeIndex) {
        let mut truth = Truth::new();
        let ty = truth
            .create_type(
                "node",
                vec![
                    PropertyDef::new("x", PropertyKind::F32),
                    PropertyDef::new("label", PropertyKind::Str),
                    PropertyDef::new("link", PropertyKind::Reference),
                ],
            )
            .unwrap();
        (truth, ty)
    }

    #[test]
    fn non_overridden_property_reads_prototype() {
        let (truth, ty) = setup();
        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(proto).unwrap();
        truth.set_f32(&mut w, 0, 1.5);
        truth.commit(w, NO_UNDO_SCOPE);

        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();
        assert_eq!(truth.get_f32(inst, 0), 1.5);
        assert!(!truth.is_overridden(inst, 0));
    }

    #[test]
    fn override_shadows_and_clear_restores() {
        let (truth, ty) = setup();
        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(proto).unwrap();
        truth.set_f32(&mut w, 0, 1.0);
        truth.commit(w, NO_UNDO_SCOPE);

        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();
        let mut w = truth.write(inst).unwrap();
        truth.set_f32(&mut w, 0, 5.0);
        truth.commit(w, NO_UNDO_SCOPE);

        assert_eq!(truth.get_f32(inst, 0), 5.0);
        assert_eq!(truth.get_f32(proto, 0), 1.0);
        assert!(truth.is_overridden(inst, 0));

        let mut w = truth.write(inst).unwrap();
        truth.clear_override(&mut w, 0);
        truth.commit(w, NO_UNDO_SCOPE);
        assert_eq!(truth.get_f32(inst, 0), 1.0);
    }

    #[test]
    fn chain_resolution_walks_to_root() {
        let (truth, ty) = setup();
        let root = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(root).unwrap();
        truth.set_string(&mut w, 1, "root");
        truth.commit(w, NO_UNDO_SCOPE);

        let mid = truth.create_object_from_prototype(root, NO_UNDO_SCOPE).unwrap();
        let leaf = truth.create_object_from_prototype(mid, NO_UNDO_SCOPE).unwrap();
        assert_eq!(&*truth.get_string(leaf, 1), "root");
    }

    #[test]
    fn kind_mismatch_returns_default() {
        let (truth, ty) = setup();
        let id = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        // Property 0 is F32; reading it as u32 logs and returns 0.
        assert_eq!(truth.get_u32(id, 0), 0);
    }

    #[test]
    fn propagate_scalar_to_prototype() {
        let (truth, ty) = setup();
        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();

        let mut w = truth.write(inst).unwrap();
        truth.set_f32(&mut w, 0, 3.0);
        truth.commit(w, NO_UNDO_SCOPE);

        truth.propagate_property(inst, 0, NO_UNDO_SCOPE).unwrap();
        assert_eq!(truth.get_f32(proto, 0), 3.0);
        assert!(!truth.is_overridden(inst, 0));
        assert_eq!(truth.get_f32(inst, 0), 3.0);
    }

    #[test]
    fn detach_materializes_values() {
        let (truth, ty) = setup();
        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(proto).unwrap();
        truth.set_f32(&mut w, 0, 2.0);
        truth.set_string(&mut w, 1, "p");
        truth.commit(w, NO_UNDO_SCOPE);

        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();
        truth.detach_from_prototype(inst, NO_UNDO_SCOPE).unwrap();

        assert!(truth.prototype(inst).is_none());
        assert_eq!(truth.get_f32(inst, 0), 2.0);
        assert_eq!(&*truth.get_string(inst, 1), "p");

        // Prototype edits no longer affect the detached object.
        let mut w = truth.write(proto).unwrap();
        truth.set_f32(&mut w, 0, 9.0);
        truth.commit(w, NO_UNDO_SCOPE);
        assert_eq!(truth.get_f32(inst, 0), 2.0);
    }

    #[test]
    fn detach_with_lookup_remaps_references() {
        let (truth, ty) = setup();
        let target = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let replacement = truth.create_object_of_type(ty, NO_UNDO_SCOPE);

        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(proto).unwrap();
        truth.set_reference(&mut w, 2, target);
        truth.commit(w, NO_UNDO_SCOPE);

        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();
        let lookup = HashMap::from([(target, replacement)]);
        truth
            .detach_from_prototype_with_lookup(inst, &lookup, NO_UNDO_SCOPE)
            .unwrap();
        assert_eq!(truth.get_reference(inst, 2), replacement);
    }

    #[test]
    fn ghost_prototype_stays_readable_until_detach() {
        let (mut truth, ty) = setup();
        let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let mut w = truth.write(proto).unwrap();
        truth.set_f32(&mut w, 0, 6.0);
        truth.commit(w, NO_UNDO_SCOPE);
        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();

        truth.destroy_object(proto, NO_UNDO_SCOPE);
        truth.garbage_collect();
        // Ghost: dead but still resolvable through the instance.
        assert!(!truth.is_alive(proto));
        assert_eq!(truth.get_f32(inst, 0), 6.0);

        truth.detach_from_prototype(inst, NO_UNDO_SCOPE).unwrap();
        truth.garbage_collect();
        assert!(truth.read(proto).is_none());
        assert_eq!(truth.get_f32(inst, 0), 6.0);
    }

    #[test]
    fn pseudo_object_commit_does_not_tick_owner() {
        let (truth, ty) = setup();
        let owner = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
        let pseudo = truth.create_pseudo_object_of_type(ty, owner, NO_UNDO_SCOPE);
        let owner_version = truth.version(owner);

        let mut w = truth.write(pseudo).unwrap();
        truth.set_f32(&mut w, 0, 1.0);
        truth.commit(w, NO_UNDO_SCOPE);
        assert_eq!(truth.version(owner), owner_version);

        truth
            .convert_pseudo_object_back_to_regular_object(pseudo, NO_UNDO_SCOPE)
            .unwrap();
        let mut w = truth.write(pseudo).unwrap();
        truth.set_f32(&mut w, 0, 2.0);
        truth.commit(w, NO_UNDO_SCOPE);
        assert!(truth.version(owner) > owner_version);
    }
}
