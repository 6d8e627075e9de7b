//! Keel Entity -- archetype-based entity runtime.
//!
//! An [`EntityContext`](context::EntityContext) groups entities by
//! component set into contiguous column storage, schedules engine and
//! system updates as parallel jobs ordered by read/write conflict
//! analysis, and defers structural changes issued from scheduled code
//! through a command queue. Entities are created from masks or from
//! Truth assets.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use keel_entity::prelude::*;
//! use keel_truth::store::Truth;
//!
//! let mut ctx = EntityContext::new(Arc::new(Truth::new()));
//! let position = ctx.register_component(ComponentDesc::new("position", 8));
//!
//! let e = ctx
//!     .create_entity_from_mask(&ComponentMask::EMPTY.with(position))
//!     .unwrap();
//! assert!(ctx.is_alive(e));
//! assert!(ctx.has_component(e, position));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod blackboard;
pub mod commands;
pub mod component;
pub mod context;
pub mod entity;
pub mod listener;
pub mod mask;
#[allow(unsafe_code)]
pub mod schedule;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

use entity::Entity;
use keel_truth::object::ObjectId;

/// Errors produced by entity operations.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// The entity does not exist (stale generation or destroyed).
    #[error("entity {0:?} does not exist (stale or destroyed)")]
    StaleEntity(Entity),

    /// A component index or name hash matches no registered component.
    #[error("component {name_hash:#x} is not registered")]
    UnknownComponent { name_hash: u64 },

    /// The asset object is not readable from the Truth.
    #[error("asset {0:?} is not readable")]
    DeadAsset(ObjectId),

    /// A Truth operation failed underneath an entity operation.
    #[error(transparent)]
    Truth(#[from] keel_truth::TruthError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::blackboard::{
        Blackboard, BlackboardValue, BLACKBOARD_DELTA_TIME, BLACKBOARD_TIME,
        BLACKBOARD_WALL_DELTA_TIME,
    };
    pub use crate::commands::{CommandBuffer, CommandTarget, EntityCommandHandle};
    pub use crate::component::{
        ComponentCallbacks, ComponentDesc, ComponentIndex, ComponentRegistrationMode,
        ComponentRegistry, GamestateRepr, MemberDef, MemberReplication, PersistenceDef,
        ReplicationDef,
    };
    pub use crate::context::{
        ArchetypeMatch, EntityContext, EntityPersistence, EntityPersistenceMode,
    };
    pub use crate::entity::Entity;
    pub use crate::mask::{ComponentMask, MAX_COMPONENTS};
    pub use crate::schedule::{
        EngineDesc, EngineUpdate, EngineUpdateArray, JobSystem, RayonJobSystem, SerialJobSystem,
        SystemContext, SystemDesc,
    };
    pub use crate::EntityError;
}
