//! Keel Truth -- versioned, copy-on-write authoritative object store.
//!
//! The [`Truth`](store::Truth) holds editable hierarchical objects with
//! prototype inheritance, undo/redo, change tracking, and safe concurrent
//! read/write. Reads are lock-free (a single atomic acquire of the current
//! snapshot); writes edit a private copy and publish it atomically.
//!
//! # Quick Start
//!
//! ```
//! use keel_truth::prelude::*;
//!
//! let mut truth = Truth::new();
//! let ty = truth
//!     .create_type("point", vec![
//!         PropertyDef::new("x", PropertyKind::F32),
//!         PropertyDef::new("y", PropertyKind::F32),
//!     ])
//!     .unwrap();
//!
//! let id = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
//! let mut w = truth.write(id).unwrap();
//! truth.set_f32(&mut w, 0, 1.0);
//! truth.commit(w, NO_UNDO_SCOPE);
//!
//! assert_eq!(truth.get_f32(id, 0), 1.0);
//! ```

#![deny(unsafe_code)]

pub mod buffers;
pub mod changes;
pub mod hash;
pub mod interner;
pub mod object;
pub mod prototype;
pub mod serialize;
pub mod store;
pub mod types;
pub mod undo;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

use object::ObjectId;

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum TruthError {
    /// The object does not exist (stale generation, reclaimed, or never
    /// created).
    #[error("object {0:?} does not exist or is no longer readable")]
    DeadObject(ObjectId),

    /// A type name was re-registered with different properties.
    #[error("type '{name}' already registered with different properties")]
    TypeMismatch { name: String },

    /// A property index does not exist on the object's type.
    #[error("type '{type_name}' has no property {property}")]
    UnknownProperty { type_name: String, property: u32 },

    /// A serialized type hash matches no created type.
    #[error("unknown type hash {0:#x}")]
    UnknownType(u64),

    /// The object has no prototype but the operation requires one.
    #[error("object {0:?} has no prototype")]
    NoPrototype(ObjectId),

    /// The prototype chain has no subobject where one was expected.
    #[error("prototype of {object:?} has no subobject at property {property}")]
    MissingPrototypeSubobject { object: ObjectId, property: u32 },

    /// Wire encode/decode failure.
    #[error("wire format error: {0}")]
    Wire(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::buffers::{BufferRef, BufferStore};
    pub use crate::changes::{ChangeOp, ChangeValue, ChangedObjects, ChangelogEntry};
    pub use crate::hash::{hash_name, NameHash};
    pub use crate::object::{ObjectId, ObjectSnapshot, PropertyValue, SetDelta};
    pub use crate::store::{ObjectWriter, Truth};
    pub use crate::types::{
        AspectId, PropertyDef, PropertyKind, TypeIndex, TypeInfo, TypeRegistry, MAX_PROPERTIES,
    };
    pub use crate::undo::{UndoAction, UndoScopeId, NO_UNDO_SCOPE};
    pub use crate::TruthError;
}
