//! The persistence bridge.
//!
//! [`PersistenceBridge`] walks persistent entities, detects component
//! changes by content hash, and pushes serialized buffers into the
//! [`Gamestate`](crate::gamestate::Gamestate). Restoring runs the other
//! direction: entities are rebuilt from the stored buffers, components
//! deserialized in ascending `restore_sort_order`, and each component's
//! `asset_reloaded` callback fires afterwards.

use std::collections::HashMap;

use tracing::warn;

use keel_entity::component::{ComponentDesc, ComponentIndex};
use keel_entity::context::{EntityContext, EntityPersistenceMode};
use keel_entity::entity::Entity;
use keel_entity::mask::ComponentMask;
use keel_truth::hash::hash_bytes;

use crate::gamestate::Gamestate;
use crate::GamestateError;

/// Change-detecting projection of entity component state into a
/// gamestate.
#[derive(Debug, Default)]
pub struct PersistenceBridge {
    /// (persistent_id, component name hash) -> content hash last pushed.
    pushed: HashMap<(u64, u64), u64>,
}

fn content_hash(desc: &ComponentDesc, entity: Entity, data: &[u8]) -> u64 {
    match desc
        .gamestate
        .as_ref()
        .and_then(|g| g.compute_hash.as_ref())
    {
        Some(compute) => compute(entity, data),
        None => hash_bytes(data),
    }
}

fn serialize_component(desc: &ComponentDesc, data: &[u8]) -> Vec<u8> {
    match desc.gamestate.as_ref().and_then(|g| g.serialize.as_ref()) {
        Some(serialize) => serialize(data),
        None => data.to_vec(),
    }
}

impl PersistenceBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk every persistent entity's auto-tracked components and push
    /// those whose content hash changed since the last walk. Returns the
    /// number of pushed buffers.
    ///
    /// Components with `persistence.manual_tracking` are skipped; they
    /// push through their own path.
    pub fn propagate_persistence_changes_to_gamestate(
        &mut self,
        ctx: &EntityContext,
        gamestate: &mut Gamestate,
    ) -> usize {
        let mut pushed = 0;
        for (entity, mark) in ctx.persistent_entities() {
            let replicated = mark.mode == EntityPersistenceMode::PersistentReplicated;
            for (component, desc) in ctx.registry().iter() {
                if desc.gamestate.is_none() {
                    continue;
                }
                if desc
                    .persistence
                    .as_ref()
                    .map(|p| p.manual_tracking)
                    .unwrap_or(false)
                {
                    continue;
                }
                let Some(data) = ctx.get_component(entity, component) else {
                    continue;
                };
                let hash = content_hash(desc, entity, data);
                let key = (mark.persistent_id, desc.name_hash);
                if self.pushed.get(&key) == Some(&hash) {
                    continue;
                }
                gamestate.set_component(
                    mark.persistent_id,
                    desc.name_hash,
                    serialize_component(desc, data),
                    replicated,
                );
                self.pushed.insert(key, hash);
                pushed += 1;
            }
        }
        pushed
    }

    /// Push one component of one entity explicitly (the manual-tracking
    /// path).
    pub fn push_component(
        &mut self,
        ctx: &EntityContext,
        gamestate: &mut Gamestate,
        entity: Entity,
        component: ComponentIndex,
    ) -> Result<(), GamestateError> {
        let mark = ctx
            .entity_persistence(entity)
            .ok_or(GamestateError::NotPersistent(entity))?;
        let desc = ctx
            .registry()
            .get(component)
            .ok_or(GamestateError::UnknownComponent(component))?;
        let data = ctx
            .get_component(entity, component)
            .ok_or(GamestateError::MissingComponent(entity, component))?;
        let hash = content_hash(desc, entity, data);
        gamestate.set_component(
            mark.persistent_id,
            desc.name_hash,
            serialize_component(desc, data),
            mark.mode == EntityPersistenceMode::PersistentReplicated,
        );
        self.pushed.insert((mark.persistent_id, desc.name_hash), hash);
        Ok(())
    }

    /// Rebuild the entities of a gamestate into `ctx`. Components restore
    /// in ascending `restore_sort_order`; each restored component's
    /// `asset_reloaded` callback fires after its payload landed. Returns
    /// the restored entities in persistent-id order.
    pub fn restore(
        &mut self,
        ctx: &mut EntityContext,
        gamestate: &Gamestate,
    ) -> Result<Vec<Entity>, GamestateError> {
        let mut restored = Vec::new();
        for (persistent_id, object) in gamestate.objects() {
            // Resolve stored component hashes against the live registry.
            let mut present: Vec<(ComponentIndex, u64, u32)> = Vec::new();
            for (&component_hash, _) in &object.components {
                let Some(component) = ctx.lookup_component(component_hash) else {
                    warn!(
                        persistent_id,
                        component_hash,
                        "stored component unknown to this context, dropped"
                    );
                    continue;
                };
                let order = ctx
                    .registry()
                    .get(component)
                    .and_then(|d| d.gamestate.as_ref())
                    .map(|g| g.restore_sort_order)
                    .unwrap_or(0);
                present.push((component, component_hash, order));
            }
            present.sort_by_key(|&(component, _, order)| (order, component.raw()));

            let mask = ComponentMask::from_components(
                &present.iter().map(|&(c, _, _)| c).collect::<Vec<_>>(),
            );
            let entity = ctx.create_entity_from_mask(&mask)?;
            let mode = if object.replicated {
                EntityPersistenceMode::PersistentReplicated
            } else {
                EntityPersistenceMode::Persistent
            };
            ctx.adopt_entity_persistence(entity, mode, persistent_id);

            for &(component, component_hash, _) in &present {
                let stored = object.components[&component_hash].clone();
                let desc = ctx.registry().get(component).expect("resolved above");
                let deserialize = desc.gamestate.as_ref().and_then(|g| g.deserialize.clone());
                let reloaded = desc.callbacks.asset_reloaded.clone();
                let name_hash = desc.name_hash;

                let Some(payload) = ctx.get_component_mut(entity, component) else {
                    continue;
                };
                match deserialize {
                    Some(deserialize) => deserialize(&stored, payload),
                    None => {
                        let n = payload.len().min(stored.len());
                        payload[..n].copy_from_slice(&stored[..n]);
                    }
                }
                if let Some(reloaded) = reloaded {
                    if let Some(payload) = ctx.get_component_mut(entity, component) {
                        reloaded(entity, payload);
                    }
                }

                // Seed change detection so an immediate propagate pass is
                // a no-op for untouched components.
                if let Some(data) = ctx.get_component(entity, component) {
                    let desc = ctx.registry().get(component).expect("resolved above");
                    let hash = content_hash(desc, entity, data);
                    self.pushed.insert((persistent_id, name_hash), hash);
                }
            }
            restored.push(entity);
        }
        Ok(restored)
    }

    /// Forget the change-detection state of a persistent id (e.g. after
    /// the entity was removed from the gamestate).
    pub fn forget(&mut self, persistent_id: u64) {
        self.pushed.retain(|(id, _), _| *id != persistent_id);
    }
}
