//! Deferred structural mutations.
//!
//! Engines and systems must not change the world's structure while the
//! scheduler runs; they queue creates, destroys, and component
//! add/removes into a [`CommandBuffer`] instead. The owning context
//! drains the queue at the next synchronization point in a fixed order:
//! creates first (so handles resolve), then add/remove in submission
//! order, then destroys, then clears.
//!
//! Entities created through the buffer are addressed by an
//! [`EntityCommandHandle`] until the drain; handles are only meaningful
//! within the buffer that produced them.

use std::fmt;
use std::sync::Arc;

use keel_truth::object::ObjectId;

use crate::component::ComponentIndex;
use crate::entity::Entity;
use crate::mask::ComponentMask;

// ---------------------------------------------------------------------------
// Handles and targets
// ---------------------------------------------------------------------------

/// Placeholder for an entity created by this buffer, resolved at drain
/// time. Valid only within the producing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityCommandHandle(pub(crate) u32);

/// Target of a queued component mutation: a live entity or a handle from
/// the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    Entity(Entity),
    Handle(EntityCommandHandle),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Command {
    CreateFromMask {
        mask: ComponentMask,
    },
    CreateFromAsset {
        asset: ObjectId,
    },
    AddComponent {
        target: CommandTarget,
        component: ComponentIndex,
        /// Scratch payload; copied over the column slot at drain time,
        /// after the component's `add` callback ran.
        data: Vec<u8>,
    },
    RemoveComponent {
        target: CommandTarget,
        component: ComponentIndex,
    },
    Destroy {
        entity: Entity,
    },
    ClearWorld,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Queue of deferred structural mutations.
pub struct CommandBuffer {
    pub(crate) commands: Vec<Command>,
    /// Number of create commands queued so far (handle space).
    created: u32,
    /// Payload sizes by component index, snapshotted from the registry so
    /// scratch buffers can be allocated without the context.
    sizes: Arc<[usize]>,
}

impl CommandBuffer {
    pub(crate) fn new(sizes: Arc<[usize]>) -> Self {
        Self {
            commands: Vec::new(),
            created: 0,
            sizes,
        }
    }

    /// Queue creation of an entity with the given component mask.
    pub fn create_entity_from_mask(&mut self, mask: &ComponentMask) -> EntityCommandHandle {
        let handle = EntityCommandHandle(self.created);
        self.created += 1;
        self.commands.push(Command::CreateFromMask { mask: *mask });
        handle
    }

    /// Batch variant of [`create_entity_from_mask`](Self::create_entity_from_mask).
    pub fn create_entities_from_mask(
        &mut self,
        mask: &ComponentMask,
        count: usize,
    ) -> Vec<EntityCommandHandle> {
        (0..count)
            .map(|_| self.create_entity_from_mask(mask))
            .collect()
    }

    /// Queue creation of an entity from a Truth asset.
    pub fn create_entity_from_asset(&mut self, asset: ObjectId) -> EntityCommandHandle {
        let handle = EntityCommandHandle(self.created);
        self.created += 1;
        self.commands.push(Command::CreateFromAsset { asset });
        handle
    }

    /// Batch variant of [`create_entity_from_asset`](Self::create_entity_from_asset).
    pub fn create_entities_from_asset(
        &mut self,
        asset: ObjectId,
        count: usize,
    ) -> Vec<EntityCommandHandle> {
        (0..count)
            .map(|_| self.create_entity_from_asset(asset))
            .collect()
    }

    /// Queue destruction of a live entity. It stays alive until the queue
    /// drains.
    pub fn destroy_entity(&mut self, entity: Entity) {
        self.commands.push(Command::Destroy { entity });
    }

    /// Batch variant of [`destroy_entity`](Self::destroy_entity).
    pub fn destroy_entities(&mut self, entities: &[Entity]) {
        for &entity in entities {
            self.destroy_entity(entity);
        }
    }

    /// Queue adding a component to a live entity. Returns the zeroed
    /// scratch payload; bytes written to it are copied into the final
    /// column slot at drain time, overwriting whatever the component's
    /// `add` callback produced. Do not queue the same (entity, component)
    /// pair twice in one buffer.
    pub fn add_component(&mut self, entity: Entity, component: ComponentIndex) -> &mut [u8] {
        self.push_add(CommandTarget::Entity(entity), component)
    }

    /// [`add_component`](Self::add_component) addressing an entity created
    /// by this buffer.
    pub fn add_component_by_handle(
        &mut self,
        handle: EntityCommandHandle,
        component: ComponentIndex,
    ) -> &mut [u8] {
        self.push_add(CommandTarget::Handle(handle), component)
    }

    fn push_add(&mut self, target: CommandTarget, component: ComponentIndex) -> &mut [u8] {
        let bytes = self
            .sizes
            .get(component.raw() as usize)
            .copied()
            .unwrap_or(0);
        self.commands.push(Command::AddComponent {
            target,
            component,
            data: vec![0; bytes],
        });
        match self.commands.last_mut() {
            Some(Command::AddComponent { data, .. }) => data,
            _ => unreachable!("just pushed"),
        }
    }

    /// Queue removing a component from a live entity.
    pub fn remove_component(&mut self, entity: Entity, component: ComponentIndex) {
        self.commands.push(Command::RemoveComponent {
            target: CommandTarget::Entity(entity),
            component,
        });
    }

    /// [`remove_component`](Self::remove_component) addressing an entity
    /// created by this buffer.
    pub fn remove_component_by_handle(
        &mut self,
        handle: EntityCommandHandle,
        component: ComponentIndex,
    ) {
        self.commands.push(Command::RemoveComponent {
            target: CommandTarget::Handle(handle),
            component,
        });
    }

    /// Queue destruction of every entity in the context.
    pub fn clear_world(&mut self) {
        self.commands.push(Command::ClearWorld);
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Append `other`'s commands, rebasing its handles into this buffer's
    /// handle space. Used by the scheduler to combine per-task buffers in
    /// submission order.
    pub(crate) fn merge(&mut self, other: CommandBuffer) {
        let base = self.created;
        for mut command in other.commands {
            match &mut command {
                Command::AddComponent { target, .. } | Command::RemoveComponent { target, .. } => {
                    if let CommandTarget::Handle(h) = target {
                        *target = CommandTarget::Handle(EntityCommandHandle(h.0 + base));
                    }
                }
                _ => {}
            }
            self.commands.push(command);
        }
        self.created += other.created;
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.commands.len())
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> Arc<[usize]> {
        Arc::from(vec![4usize, 8, 0].into_boxed_slice())
    }

    #[test]
    fn handles_count_creates() {
        let mut buf = CommandBuffer::new(sizes());
        let mask = ComponentMask::EMPTY.with(ComponentIndex(0));
        let h0 = buf.create_entity_from_mask(&mask);
        let h1 = buf.create_entity_from_asset(ObjectId::NONE);
        assert_eq!(h0, EntityCommandHandle(0));
        assert_eq!(h1, EntityCommandHandle(1));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn add_component_hands_out_zeroed_scratch() {
        let mut buf = CommandBuffer::new(sizes());
        let scratch = buf.add_component(Entity::new(1, 0), ComponentIndex(1));
        assert_eq!(scratch.len(), 8);
        assert!(scratch.iter().all(|&b| b == 0));
        scratch.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        match &buf.commands[0] {
            Command::AddComponent { data, .. } => {
                assert_eq!(data, &[1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("expected AddComponent, got {other:?}"),
        }
    }

    #[test]
    fn merge_rebases_handles() {
        let mask = ComponentMask::EMPTY.with(ComponentIndex(0));

        let mut a = CommandBuffer::new(sizes());
        a.create_entity_from_mask(&mask);

        let mut b = CommandBuffer::new(sizes());
        let bh = b.create_entity_from_mask(&mask);
        b.add_component_by_handle(bh, ComponentIndex(1));

        a.merge(b);
        match &a.commands[2] {
            Command::AddComponent {
                target: CommandTarget::Handle(h),
                ..
            } => assert_eq!(*h, EntityCommandHandle(1)),
            other => panic!("expected rebased AddComponent, got {other:?}"),
        }
    }
}
