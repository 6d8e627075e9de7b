//! Object type registry.
//!
//! Every object in the store has a type created once at startup through
//! [`TypeRegistry::create_type`]. A type is a named, ordered list of
//! property definitions plus optional aspects (shared interface pointers
//! attached per type or per property). Types are never destroyed;
//! properties may be appended for data migration but never change kind.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hash::{hash_name, NameHash};
use crate::object::ObjectId;
use crate::TruthError;

/// Properties per type are capped so the overridden-set fits a 64-bit mask.
pub const MAX_PROPERTIES: usize = 64;

// ---------------------------------------------------------------------------
// PropertyKind
// ---------------------------------------------------------------------------

/// The storage kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Bool,
    U32,
    U64,
    F32,
    F64,
    /// Interned string.
    Str,
    /// Reference to an immutable byte blob.
    Buffer,
    /// Weak reference to another object (not owned).
    Reference,
    /// Owned child object.
    Subobject,
    /// Set of weak references, stored as deltas against the prototype.
    ReferenceSet,
    /// Set of owned child objects, stored as deltas against the prototype.
    SubobjectSet,
}

// ---------------------------------------------------------------------------
// PropertyDef
// ---------------------------------------------------------------------------

/// Definition of a single property of a type.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub name_hash: NameHash,
    pub kind: PropertyKind,
    /// For reference/subobject kinds: the name hash of the expected target
    /// type. `0` means "any type".
    pub target_type_hash: NameHash,
    /// Skip this property when serializing the object.
    pub not_serialized: bool,
    /// Permit targets of other types than `target_type_hash`.
    pub allow_other_types: bool,
    /// Hint for editor widgets; opaque to the store.
    pub editor_hint: Option<String>,
    pub tooltip: Option<String>,
}

impl PropertyDef {
    /// New property with the given name and kind; other fields default.
    pub fn new(name: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_owned(),
            name_hash: hash_name(name),
            kind,
            target_type_hash: 0,
            not_serialized: false,
            allow_other_types: false,
            editor_hint: None,
            tooltip: None,
        }
    }

    /// Constrain reference/subobject targets to a type (by name hash).
    pub fn with_target(mut self, target_type_hash: NameHash) -> Self {
        self.target_type_hash = target_type_hash;
        self
    }

    /// Exclude from serialization.
    pub fn not_serialized(mut self) -> Self {
        self.not_serialized = true;
        self
    }

    /// Permit targets of other types than the declared target type.
    pub fn allow_other_types(mut self) -> Self {
        self.allow_other_types = true;
        self
    }
}

// ---------------------------------------------------------------------------
// TypeIndex / TypeInfo
// ---------------------------------------------------------------------------

/// Dense index identifying a created type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeIndex(pub(crate) u32);

impl TypeIndex {
    /// Raw dense index.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeIndex({})", self.0)
    }
}

/// Immutable description of a type. Snapshots hold an `Arc<TypeInfo>` so
/// property layout stays consistent for the snapshot's lifetime even across
/// [`TypeRegistry::add_properties`] migrations.
#[derive(Debug)]
pub struct TypeInfo {
    pub index: TypeIndex,
    pub name: String,
    pub name_hash: NameHash,
    pub properties: Vec<PropertyDef>,
}

impl TypeInfo {
    /// Find a property index by name hash, checking the kind.
    ///
    /// Returns `None` for an unknown hash or a kind mismatch.
    pub fn find_property(&self, name_hash: NameHash, kind: PropertyKind) -> Option<u32> {
        self.properties
            .iter()
            .position(|p| p.name_hash == name_hash && p.kind == kind)
            .map(|i| i as u32)
    }

    /// Find a property index by name hash regardless of kind.
    pub fn property_index(&self, name_hash: NameHash) -> Option<u32> {
        self.properties
            .iter()
            .position(|p| p.name_hash == name_hash)
            .map(|i| i as u32)
    }

    /// The property definition at `index`, if in range.
    pub fn property(&self, index: u32) -> Option<&PropertyDef> {
        self.properties.get(index as usize)
    }
}

// ---------------------------------------------------------------------------
// Aspects
// ---------------------------------------------------------------------------

/// Aspect interfaces are identified by a name hash.
pub type AspectId = NameHash;

/// A shared, type-erased aspect interface.
pub type AspectPtr = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Registry of all created types.
///
/// All mutating operations are startup/single-thread operations and take
/// `&mut self`; lookups take `&self` and are safe to call concurrently with
/// object reads.
#[derive(Default)]
pub struct TypeRegistry {
    types: Vec<Arc<TypeInfo>>,
    by_hash: HashMap<NameHash, TypeIndex>,
    /// Default object per type (`ObjectId::NONE` when unset).
    defaults: Vec<ObjectId>,
    aspects: HashMap<(u32, AspectId), AspectPtr>,
    property_aspects: HashMap<(u32, u32, AspectId), AspectPtr>,
    default_aspects: HashMap<AspectId, AspectPtr>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a type. Re-registering the same name with identical
    /// properties returns the existing index; the same name with different
    /// properties is rejected.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_PROPERTIES`] properties are declared.
    pub fn create_type(
        &mut self,
        name: &str,
        properties: Vec<PropertyDef>,
    ) -> Result<TypeIndex, TruthError> {
        assert!(
            properties.len() <= MAX_PROPERTIES,
            "type '{}' declares {} properties, maximum is {}",
            name,
            properties.len(),
            MAX_PROPERTIES
        );
        let name_hash = hash_name(name);
        if let Some(&existing) = self.by_hash.get(&name_hash) {
            let info = &self.types[existing.0 as usize];
            if info.properties == properties {
                return Ok(existing);
            }
            return Err(TruthError::TypeMismatch {
                name: name.to_owned(),
            });
        }
        let index = TypeIndex(self.types.len() as u32);
        self.types.push(Arc::new(TypeInfo {
            index,
            name: name.to_owned(),
            name_hash,
            properties,
        }));
        self.by_hash.insert(name_hash, index);
        self.defaults.push(ObjectId::NONE);
        Ok(index)
    }

    /// Append properties to an existing type (data migration). Existing
    /// snapshots are re-laid by the owning store; the registry only swaps
    /// in the new immutable [`TypeInfo`].
    ///
    /// # Panics
    ///
    /// Panics if the total property count would exceed [`MAX_PROPERTIES`].
    pub fn add_properties(&mut self, ty: TypeIndex, extra: Vec<PropertyDef>) -> Arc<TypeInfo> {
        let old = &self.types[ty.0 as usize];
        let total = old.properties.len() + extra.len();
        assert!(
            total <= MAX_PROPERTIES,
            "type '{}' would have {} properties, maximum is {}",
            old.name,
            total,
            MAX_PROPERTIES
        );
        let mut properties = old.properties.clone();
        properties.extend(extra);
        let info = Arc::new(TypeInfo {
            index: ty,
            name: old.name.clone(),
            name_hash: old.name_hash,
            properties,
        });
        self.types[ty.0 as usize] = Arc::clone(&info);
        info
    }

    /// The immutable info for a type.
    pub fn info(&self, ty: TypeIndex) -> &Arc<TypeInfo> {
        &self.types[ty.0 as usize]
    }

    /// Info by raw index, if in range.
    pub fn info_checked(&self, ty: TypeIndex) -> Option<&Arc<TypeInfo>> {
        self.types.get(ty.0 as usize)
    }

    /// Look up a type by its name hash.
    pub fn find_type(&self, name_hash: NameHash) -> Option<TypeIndex> {
        self.by_hash.get(&name_hash).copied()
    }

    /// Number of created types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types have been created.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Set the default object cloned into new objects of `ty`.
    pub fn set_default_object(&mut self, ty: TypeIndex, id: ObjectId) {
        self.defaults[ty.0 as usize] = id;
    }

    /// The default object of `ty`, or `ObjectId::NONE`.
    pub fn default_object(&self, ty: TypeIndex) -> ObjectId {
        self.defaults
            .get(ty.0 as usize)
            .copied()
            .unwrap_or(ObjectId::NONE)
    }

    // -- aspects ------------------------------------------------------------

    /// Attach an aspect to a type.
    pub fn set_aspect(&mut self, ty: TypeIndex, aspect: AspectId, ptr: AspectPtr) {
        self.aspects.insert((ty.0, aspect), ptr);
    }

    /// Attach a fallback aspect used when a type has no specific one.
    pub fn set_default_aspect(&mut self, aspect: AspectId, ptr: AspectPtr) {
        self.default_aspects.insert(aspect, ptr);
    }

    /// Attach an aspect to a single property of a type.
    pub fn set_property_aspect(
        &mut self,
        ty: TypeIndex,
        property: u32,
        aspect: AspectId,
        ptr: AspectPtr,
    ) {
        self.property_aspects.insert((ty.0, property, aspect), ptr);
    }

    /// The aspect for `ty`, falling back to the default aspect.
    pub fn get_aspect(&self, ty: TypeIndex, aspect: AspectId) -> Option<AspectPtr> {
        self.aspects
            .get(&(ty.0, aspect))
            .or_else(|| self.default_aspects.get(&aspect))
            .cloned()
    }

    /// The aspect attached to a single property, if any.
    pub fn get_property_aspect(
        &self,
        ty: TypeIndex,
        property: u32,
        aspect: AspectId,
    ) -> Option<AspectPtr> {
        self.property_aspects.get(&(ty.0, property, aspect)).cloned()
    }

    /// Drop all per-type and per-property aspects so callers can re-register
    /// them after a code reload. Default aspects are kept.
    pub fn reload_aspects(&mut self) {
        self.aspects.clear();
        self.property_aspects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Vec<PropertyDef> {
        vec![
            PropertyDef::new("x", PropertyKind::F32),
            PropertyDef::new("name", PropertyKind::Str),
        ]
    }

    #[test]
    fn create_and_find() {
        let mut reg = TypeRegistry::new();
        let ty = reg.create_type("thing", props()).unwrap();
        assert_eq!(reg.find_type(hash_name("thing")), Some(ty));
        assert_eq!(reg.info(ty).name, "thing");
    }

    #[test]
    fn reregister_same_properties_returns_existing() {
        let mut reg = TypeRegistry::new();
        let a = reg.create_type("thing", props()).unwrap();
        let b = reg.create_type("thing", props()).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregister_different_properties_rejected() {
        let mut reg = TypeRegistry::new();
        reg.create_type("thing", props()).unwrap();
        let err = reg.create_type("thing", vec![]).unwrap_err();
        assert!(matches!(err, TruthError::TypeMismatch { .. }));
    }

    #[test]
    fn find_property_checks_kind() {
        let mut reg = TypeRegistry::new();
        let ty = reg.create_type("thing", props()).unwrap();
        let info = reg.info(ty);
        assert_eq!(info.find_property(hash_name("x"), PropertyKind::F32), Some(0));
        assert_eq!(info.find_property(hash_name("x"), PropertyKind::U32), None);
        assert_eq!(info.find_property(hash_name("missing"), PropertyKind::F32), None);
    }

    #[test]
    #[should_panic(expected = "maximum")]
    fn too_many_properties_is_fatal() {
        let mut reg = TypeRegistry::new();
        let many: Vec<PropertyDef> = (0..65)
            .map(|i| PropertyDef::new(&format!("p{i}"), PropertyKind::U32))
            .collect();
        let _ = reg.create_type("wide", many);
    }

    #[test]
    fn aspects_fall_back_to_default() {
        let mut reg = TypeRegistry::new();
        let ty = reg.create_type("thing", props()).unwrap();
        let aspect = hash_name("editor_ui");
        assert!(reg.get_aspect(ty, aspect).is_none());

        reg.set_default_aspect(aspect, Arc::new(1u32));
        let fallback = reg.get_aspect(ty, aspect).unwrap();
        assert_eq!(*fallback.downcast_ref::<u32>().unwrap(), 1);

        reg.set_aspect(ty, aspect, Arc::new(2u32));
        let specific = reg.get_aspect(ty, aspect).unwrap();
        assert_eq!(*specific.downcast_ref::<u32>().unwrap(), 2);
    }

    #[test]
    fn reload_clears_per_type_aspects() {
        let mut reg = TypeRegistry::new();
        let ty = reg.create_type("thing", props()).unwrap();
        let aspect = hash_name("editor_ui");
        reg.set_aspect(ty, aspect, Arc::new(2u32));
        reg.set_default_aspect(aspect, Arc::new(1u32));
        reg.reload_aspects();
        // Per-type aspect gone, default still answers.
        let got = reg.get_aspect(ty, aspect).unwrap();
        assert_eq!(*got.downcast_ref::<u32>().unwrap(), 1);
    }
}
