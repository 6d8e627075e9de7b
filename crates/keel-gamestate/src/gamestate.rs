//! The gamestate store.
//!
//! A [`Gamestate`] holds serialized component buffers keyed by a stable
//! 64-bit persistent id and the component's name hash. It is the
//! authoritative record of persistent entity state: the bridge projects
//! live component data into it, and a saved gamestate can rebuild the
//! entities of a fresh context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::GamestateError;

/// The serialized components of one persistent entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GamestateObject {
    /// Component name hash -> serialized buffer.
    pub components: HashMap<u64, Vec<u8>>,
    /// Whether the network layer replicates this entity's changes.
    pub replicated: bool,
}

/// Persistent-id keyed store of serialized component state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Gamestate {
    objects: HashMap<u64, GamestateObject>,
}

impl Gamestate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a component buffer for a persistent id.
    pub fn set_component(
        &mut self,
        persistent_id: u64,
        component_hash: u64,
        data: Vec<u8>,
        replicated: bool,
    ) {
        let object = self.objects.entry(persistent_id).or_default();
        object.replicated = replicated;
        object.components.insert(component_hash, data);
    }

    /// A stored component buffer.
    pub fn component(&self, persistent_id: u64, component_hash: u64) -> Option<&[u8]> {
        self.objects
            .get(&persistent_id)
            .and_then(|o| o.components.get(&component_hash))
            .map(Vec::as_slice)
    }

    /// The stored object for a persistent id.
    pub fn object(&self, persistent_id: u64) -> Option<&GamestateObject> {
        self.objects.get(&persistent_id)
    }

    /// Forget a persistent entity.
    pub fn remove_object(&mut self, persistent_id: u64) {
        self.objects.remove(&persistent_id);
    }

    /// Iterate `(persistent_id, object)` pairs in id order.
    pub fn objects(&self) -> Vec<(u64, &GamestateObject)> {
        let mut out: Vec<_> = self.objects.iter().map(|(&id, o)| (id, o)).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Number of persistent entities stored.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize the whole store to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GamestateError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| GamestateError::Wire(e.to_string()))
    }

    /// Rebuild a store serialized with [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self, GamestateError> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(state, _len)| state)
            .map_err(|e| GamestateError::Wire(e.to_string()))
    }
}
