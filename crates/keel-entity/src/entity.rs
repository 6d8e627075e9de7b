//! Entity identifiers and the entity index table.
//!
//! An [`Entity`] packs a generation in the high 32 bits and a slot index in
//! the low 32, so stale handles are detected immediately. The
//! [`EntityTable`] maps live slots to their archetype location and tracks
//! the parent link used by asset-spawned hierarchies.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle. The all-zero value means "no entity".
///
/// Layout: `[generation: u32 | index: u32]`; slot index 0 is reserved.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// The "no entity" handle.
    pub const NONE: Entity = Entity(0);

    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// Slot index (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// Generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this is the "no entity" handle.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this refers to some entity slot.
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Raw 64-bit representation.
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

impl Default for Entity {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Entity(none)")
        } else {
            write!(f, "Entity({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityTable
// ---------------------------------------------------------------------------

/// Where an entity's row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub archetype: u32,
    pub row: u32,
}

/// Slot table: generation, alive flag, archetype location, parent link.
///
/// Free indices are recycled FIFO so generations spread over many slots
/// instead of burning through one hot index.
#[derive(Debug)]
pub(crate) struct EntityTable {
    generations: Vec<u32>,
    alive: Vec<bool>,
    locations: Vec<EntityLocation>,
    parents: Vec<Entity>,
    free: VecDeque<u32>,
}

impl EntityTable {
    pub fn new() -> Self {
        // Slot 0 is reserved so the all-zero Entity stays "none".
        Self {
            generations: vec![0],
            alive: vec![false],
            locations: vec![EntityLocation {
                archetype: 0,
                row: 0,
            }],
            parents: vec![Entity::NONE],
            free: VecDeque::new(),
        }
    }

    pub fn allocate(&mut self) -> Entity {
        if let Some(index) = self.free.pop_front() {
            // Generation was bumped at deallocation.
            self.alive[index as usize] = true;
            self.parents[index as usize] = Entity::NONE;
            Entity::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            self.locations.push(EntityLocation {
                archetype: 0,
                row: 0,
            });
            self.parents.push(Entity::NONE);
            Entity::new(index, 0)
        }
    }

    /// Free a slot, bumping its generation so outstanding handles go stale.
    /// Returns false for stale or dead handles.
    pub fn deallocate(&mut self, e: Entity) -> bool {
        let idx = e.index() as usize;
        if idx == 0 || idx >= self.generations.len() {
            return false;
        }
        if self.generations[idx] != e.generation() || !self.alive[idx] {
            return false;
        }
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.parents[idx] = Entity::NONE;
        self.free.push_back(e.index());
        true
    }

    pub fn is_alive(&self, e: Entity) -> bool {
        let idx = e.index() as usize;
        idx != 0
            && idx < self.generations.len()
            && self.alive[idx]
            && self.generations[idx] == e.generation()
    }

    pub fn location(&self, e: Entity) -> Option<EntityLocation> {
        if self.is_alive(e) {
            Some(self.locations[e.index() as usize])
        } else {
            None
        }
    }

    pub fn set_location(&mut self, e: Entity, location: EntityLocation) {
        self.locations[e.index() as usize] = location;
    }

    pub fn parent(&self, e: Entity) -> Entity {
        if self.is_alive(e) {
            self.parents[e.index() as usize]
        } else {
            Entity::NONE
        }
    }

    pub fn set_parent(&mut self, e: Entity, parent: Entity) {
        self.parents[e.index() as usize] = parent;
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    pub fn all_entities(&self) -> Vec<Entity> {
        (1..self.generations.len())
            .filter(|&i| self.alive[i])
            .map(|i| Entity::new(i as u32, self.generations[i]))
            .collect()
    }
}
