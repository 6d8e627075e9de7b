//! Keel Gamestate -- persistence bridge between the entity runtime and
//! the authoritative gamestate store.
//!
//! Components opt into persistence through their
//! [`GamestateRepr`](keel_entity::component::GamestateRepr); the
//! [`PersistenceBridge`](bridge::PersistenceBridge) detects changes by
//! content hash and pushes serialized buffers into the
//! [`Gamestate`](gamestate::Gamestate) under stable 64-bit persistent
//! ids. A stored gamestate rebuilds entities in a fresh context.

#![deny(unsafe_code)]

pub mod bridge;
pub mod gamestate;

use keel_entity::component::ComponentIndex;
use keel_entity::entity::Entity;

/// Errors produced by gamestate operations.
#[derive(Debug, thiserror::Error)]
pub enum GamestateError {
    /// The entity carries no persistence mark.
    #[error("entity {0:?} is not persistent")]
    NotPersistent(Entity),

    /// The component index is not registered.
    #[error("component {0:?} is not registered")]
    UnknownComponent(ComponentIndex),

    /// The entity does not have the component.
    #[error("entity {0:?} has no component {1:?}")]
    MissingComponent(Entity, ComponentIndex),

    /// An entity operation failed during restore.
    #[error(transparent)]
    Entity(#[from] keel_entity::EntityError),

    /// Gamestate encode/decode failure.
    #[error("gamestate wire error: {0}")]
    Wire(String),
}

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bridge::PersistenceBridge;
    pub use crate::gamestate::{Gamestate, GamestateObject};
    pub use crate::GamestateError;
}
