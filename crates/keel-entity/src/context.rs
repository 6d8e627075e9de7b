//! The entity context.
//!
//! [`EntityContext`] owns the entity table, the component registry, and
//! all archetype storage, and bridges to the Truth for asset-driven entity
//! creation. Structural mutations (create/destroy/add/remove) take
//! `&mut self`; from scheduled engine and system code they are therefore
//! only reachable through the command queue.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use tracing::warn;

use keel_truth::hash::hash_name;
use keel_truth::object::ObjectId;
use keel_truth::store::Truth;
use keel_truth::types::PropertyKind;

use crate::archetype::{transfer_row, Archetype};
use crate::blackboard::Blackboard;
use crate::commands::{Command, CommandBuffer, CommandTarget};
use crate::component::{
    ComponentDesc, ComponentIndex, ComponentRegistrationMode, ComponentRegistry,
};
use crate::entity::{Entity, EntityLocation, EntityTable};
use crate::listener::{EntityListenerFn, EventBus, EventListenerFn, ListenerTable};
use crate::mask::ComponentMask;
use crate::schedule::{EngineDesc, SystemState};
use crate::EntityError;

/// Asset property: subobject set of component objects.
static ASSET_COMPONENTS: LazyLock<u64> = LazyLock::new(|| hash_name("components"));
/// Asset property: subobject set of child entity assets.
static ASSET_CHILDREN: LazyLock<u64> = LazyLock::new(|| hash_name("children"));

// ---------------------------------------------------------------------------
// Persistence marks
// ---------------------------------------------------------------------------

/// How an entity projects into the gamestate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPersistenceMode {
    /// Component state is pushed to the gamestate under a persistent id.
    Persistent,
    /// As `Persistent`, plus the network layer replicates changes.
    PersistentReplicated,
}

/// Persistence mark of an entity.
#[derive(Debug, Clone, Copy)]
pub struct EntityPersistence {
    pub mode: EntityPersistenceMode,
    /// Stable 64-bit identifier in the gamestate namespace.
    pub persistent_id: u64,
}

/// One archetype's worth of matching entities.
#[derive(Debug, Clone, Copy)]
pub struct ArchetypeMatch<'a> {
    pub archetype: u32,
    pub entities: &'a [Entity],
}

// ---------------------------------------------------------------------------
// EntityContext
// ---------------------------------------------------------------------------

/// The archetype-based entity runtime.
pub struct EntityContext {
    truth: Arc<Truth>,
    registry: ComponentRegistry,
    table: EntityTable,
    archetypes: Vec<Archetype>,
    by_mask: HashMap<ComponentMask, u32>,
    children: HashMap<Entity, Vec<Entity>>,
    assets: HashMap<Entity, ObjectId>,
    persistence: HashMap<Entity, EntityPersistence>,
    next_persistent_id: u64,
    pub(crate) listeners: ListenerTable,
    pub(crate) events: EventBus,
    blackboard: Blackboard,
    pub(crate) engines: Vec<EngineDesc>,
    pub(crate) systems: Vec<SystemState>,
}

impl EntityContext {
    /// Create an empty context over `truth`.
    pub fn new(truth: Arc<Truth>) -> Self {
        let registry = ComponentRegistry::new();
        // Archetype 0 holds component-less entities.
        let empty = Archetype::new(ComponentMask::EMPTY, &registry);
        let mut by_mask = HashMap::new();
        by_mask.insert(ComponentMask::EMPTY, 0);
        Self {
            truth,
            registry,
            table: EntityTable::new(),
            archetypes: vec![empty],
            by_mask,
            children: HashMap::new(),
            assets: HashMap::new(),
            persistence: HashMap::new(),
            next_persistent_id: 1,
            listeners: ListenerTable::new(),
            events: EventBus::new(),
            blackboard: Blackboard::new(),
            engines: Vec::new(),
            systems: Vec::new(),
        }
    }

    /// The backing Truth.
    pub fn truth(&self) -> &Arc<Truth> {
        &self.truth
    }

    /// The component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// The per-context blackboard.
    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    // -- component registration ---------------------------------------------

    /// Register a component explicitly (mode `None` workflows).
    pub fn register_component(&mut self, desc: ComponentDesc) -> ComponentIndex {
        self.registry.register(desc)
    }

    /// Exclude a component from a later [`create_components`](Self::create_components).
    pub fn disable_component(&mut self, name_hash: u64) {
        self.registry.disable_component(name_hash);
    }

    /// Populate the registry from `interfaces` according to `mode`.
    pub fn create_components(
        &mut self,
        mode: ComponentRegistrationMode,
        interfaces: &[ComponentDesc],
    ) {
        self.registry.create_components(mode, interfaces);
    }

    /// Look up a registered component by name hash.
    pub fn lookup_component(&self, name_hash: u64) -> Option<ComponentIndex> {
        self.registry.lookup(name_hash)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create an entity with no components.
    pub fn create_entity(&mut self) -> Entity {
        self.create_entity_from_mask(&ComponentMask::EMPTY)
            .expect("empty mask is always valid")
    }

    /// Create an entity with the given component set, running each
    /// component's `add` callback.
    pub fn create_entity_from_mask(&mut self, mask: &ComponentMask) -> Result<Entity, EntityError> {
        let archetype = self.archetype_for_mask(mask)?;
        Ok(self.spawn_into(archetype))
    }

    /// Batch variant of [`create_entity_from_mask`](Self::create_entity_from_mask);
    /// the archetype lookup is amortized over the batch.
    pub fn create_entities_from_mask(
        &mut self,
        mask: &ComponentMask,
        count: usize,
    ) -> Result<Vec<Entity>, EntityError> {
        let archetype = self.archetype_for_mask(mask)?;
        Ok((0..count).map(|_| self.spawn_into(archetype)).collect())
    }

    fn spawn_into(&mut self, archetype: u32) -> Entity {
        let entity = self.table.allocate();
        let row = self.archetypes[archetype as usize].push_row(entity, &self.registry);
        self.table.set_location(
            entity,
            EntityLocation {
                archetype,
                row: row as u32,
            },
        );
        let add_callbacks = self.component_callbacks(archetype, |c| c.add.clone());
        let arch = &mut self.archetypes[archetype as usize];
        for (component, callback) in add_callbacks {
            if let Some(callback) = callback {
                if let Some(data) = arch.component_data_mut(component, row) {
                    callback(entity, data);
                }
            }
        }
        entity
    }

    /// Create an entity from a Truth asset: the asset's `components`
    /// subobject set selects registered components (by type name hash) and
    /// initializes them through `load_asset`; the `children` set spawns
    /// child entities linked through [`parent`](Self::parent) /
    /// [`children`](Self::children).
    pub fn create_entity_from_asset(&mut self, asset: ObjectId) -> Result<Entity, EntityError> {
        let truth = Arc::clone(&self.truth);
        let snap = truth.read(asset).ok_or(EntityError::DeadAsset(asset))?;

        // Resolve component subobjects to registered components.
        let mut component_objects: Vec<(ComponentIndex, ObjectId)> = Vec::new();
        if let Some(prop) = snap
            .type_info()
            .find_property(*ASSET_COMPONENTS, PropertyKind::SubobjectSet)
        {
            for sub in truth.get_subobject_set(asset, prop) {
                let Some(info) = truth.types().info_checked(sub.type_index()) else {
                    continue;
                };
                let Some(component) = self.registry.lookup(info.name_hash) else {
                    // Component plugin unavailable: the entity spawns
                    // without it.
                    warn!(asset = ?asset, component_type = %info.name, "asset component not registered, skipped");
                    continue;
                };
                if component_objects.iter().any(|(c, _)| *c == component) {
                    warn!(asset = ?asset, component_type = %info.name, "duplicate asset component ignored");
                    continue;
                }
                component_objects.push((component, sub));
            }
        }

        let mask = ComponentMask::from_components(
            &component_objects.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
        );
        let entity = self.create_entity_from_mask(&mask)?;
        self.assets.insert(entity, asset);

        // Initialize payloads from the asset objects.
        let location = self.table.location(entity).expect("just created");
        let load_callbacks: Vec<_> = component_objects
            .iter()
            .map(|(c, sub)| {
                (
                    *c,
                    *sub,
                    self.registry.get(*c).and_then(|d| d.callbacks.load_asset.clone()),
                )
            })
            .collect();
        let arch = &mut self.archetypes[location.archetype as usize];
        for (component, sub, callback) in load_callbacks {
            if let Some(callback) = callback {
                if let Some(data) = arch.component_data_mut(component, location.row as usize) {
                    callback(&truth, sub, data);
                }
            }
        }

        // Child assets spawn child entities.
        if let Some(prop) = snap
            .type_info()
            .find_property(*ASSET_CHILDREN, PropertyKind::SubobjectSet)
        {
            for child_asset in truth.get_subobject_set(asset, prop) {
                match self.create_entity_from_asset(child_asset) {
                    Ok(child) => self.link_child(entity, child),
                    Err(err) => {
                        warn!(asset = ?child_asset, %err, "child asset could not be spawned")
                    }
                }
            }
        }
        Ok(entity)
    }

    /// Batch variant of [`create_entity_from_asset`](Self::create_entity_from_asset).
    pub fn create_entities_from_asset(
        &mut self,
        asset: ObjectId,
        count: usize,
    ) -> Result<Vec<Entity>, EntityError> {
        (0..count).map(|_| self.create_entity_from_asset(asset)).collect()
    }

    fn link_child(&mut self, parent: Entity, child: Entity) {
        self.table.set_parent(child, parent);
        self.children.entry(parent).or_default().push(child);
    }

    /// Destroy an entity, its children, and run each component's `destroy`
    /// callback. Stale handles are ignored with a warning.
    pub fn destroy_entity(&mut self, entity: Entity) {
        if !self.table.is_alive(entity) {
            warn!(?entity, "destroy of dead entity ignored");
            return;
        }
        if let Some(kids) = self.children.remove(&entity) {
            for child in kids {
                self.destroy_entity(child);
            }
        }
        let parent = self.table.parent(entity);
        if parent.is_some() {
            if let Some(list) = self.children.get_mut(&parent) {
                list.retain(|&c| c != entity);
            }
        }

        let location = self.table.location(entity).expect("alive");
        let destroy_callbacks = self.component_callbacks(location.archetype, |c| c.destroy.clone());
        let arch = &mut self.archetypes[location.archetype as usize];
        for (component, callback) in destroy_callbacks {
            if let Some(callback) = callback {
                if let Some(data) = arch.component_data_mut(component, location.row as usize) {
                    callback(entity, data);
                }
            }
        }
        let moved = arch.swap_remove_row(location.row as usize);
        if let Some(moved) = moved {
            self.table.set_location(moved, location);
        }

        self.listeners.forget_entity(entity);
        self.persistence.remove(&entity);
        self.assets.remove(&entity);
        self.table.deallocate(entity);
    }

    /// Batch variant of [`destroy_entity`](Self::destroy_entity).
    pub fn destroy_entities(&mut self, entities: &[Entity]) {
        for &entity in entities {
            if self.table.is_alive(entity) {
                self.destroy_entity(entity);
            }
        }
    }

    /// Destroy every entity in the context.
    pub fn destroy_all_entities(&mut self) {
        for entity in self.table.all_entities() {
            if self.table.is_alive(entity) {
                self.destroy_entity(entity);
            }
        }
    }

    /// Whether `entity` is alive. Queued destructions remain alive until
    /// the command queue drains.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.table.is_alive(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.table.alive_count()
    }

    /// Number of archetypes (including empty ones).
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// All live entities. Allocates; the caller owns the result.
    pub fn all_entities(&self) -> Vec<Entity> {
        self.table.all_entities()
    }

    /// The asset an entity was created from, if any.
    pub fn entity_asset(&self, entity: Entity) -> ObjectId {
        self.assets.get(&entity).copied().unwrap_or(ObjectId::NONE)
    }

    /// The parent link of an asset-spawned entity.
    pub fn parent(&self, entity: Entity) -> Entity {
        self.table.parent(entity)
    }

    /// The children of an entity. Allocates; the caller owns the result.
    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        self.children.get(&entity).cloned().unwrap_or_default()
    }

    // -- components ---------------------------------------------------------

    /// Add a component, migrating the entity to the widened archetype.
    /// Returns the payload (existing payload if the component was already
    /// present). The `add` callback runs before this returns.
    pub fn add_component(
        &mut self,
        entity: Entity,
        component: ComponentIndex,
    ) -> Result<&mut [u8], EntityError> {
        let location = self
            .table
            .location(entity)
            .ok_or(EntityError::StaleEntity(entity))?;
        let desc = self.registry.get_checked(component)?;
        let add_callback = desc.callbacks.add.clone();

        let src_index = location.archetype;
        let src_mask = *self.archetypes[src_index as usize].mask();
        if src_mask.test(component) {
            let arch = &mut self.archetypes[src_index as usize];
            return Ok(arch
                .component_data_mut(component, location.row as usize)
                .expect("component present"));
        }

        let dst_mask = src_mask.with(component);
        let dst_index = self.archetype_for_mask(&dst_mask)?;
        let (src, dst) = two_archetypes(&mut self.archetypes, src_index, dst_index);
        let (dst_row, moved) = transfer_row(src, dst, location.row as usize, &self.registry);
        if let Some(moved) = moved {
            self.table.set_location(moved, location);
        }
        self.table.set_location(
            entity,
            EntityLocation {
                archetype: dst_index,
                row: dst_row as u32,
            },
        );

        let arch = &mut self.archetypes[dst_index as usize];
        let data = arch
            .component_data_mut(component, dst_row)
            .expect("component just added");
        if let Some(callback) = add_callback {
            callback(entity, &mut *data);
        }
        Ok(data)
    }

    /// Remove a component, migrating the entity to the narrowed archetype.
    /// The `remove` callback runs while the payload is still readable.
    /// Removing an absent component is a no-op.
    pub fn remove_component(
        &mut self,
        entity: Entity,
        component: ComponentIndex,
    ) -> Result<(), EntityError> {
        let location = self
            .table
            .location(entity)
            .ok_or(EntityError::StaleEntity(entity))?;
        let desc = self.registry.get_checked(component)?;
        let remove_callback = desc.callbacks.remove.clone();

        let src_index = location.archetype;
        let src_mask = *self.archetypes[src_index as usize].mask();
        if !src_mask.test(component) {
            return Ok(());
        }

        if let Some(callback) = remove_callback {
            let arch = &mut self.archetypes[src_index as usize];
            if let Some(data) = arch.component_data_mut(component, location.row as usize) {
                callback(entity, data);
            }
        }

        let mut dst_mask = src_mask;
        dst_mask.clear(component);
        let dst_index = self.archetype_for_mask(&dst_mask)?;
        let (src, dst) = two_archetypes(&mut self.archetypes, src_index, dst_index);
        let (dst_row, moved) = transfer_row(src, dst, location.row as usize, &self.registry);
        if let Some(moved) = moved {
            self.table.set_location(moved, location);
        }
        self.table.set_location(
            entity,
            EntityLocation {
                archetype: dst_index,
                row: dst_row as u32,
            },
        );
        Ok(())
    }

    /// Whether the entity currently has the component.
    pub fn has_component(&self, entity: Entity, component: ComponentIndex) -> bool {
        self.table
            .location(entity)
            .map(|l| self.archetypes[l.archetype as usize].has_component(component))
            .unwrap_or(false)
    }

    /// The component payload of an entity.
    pub fn get_component(&self, entity: Entity, component: ComponentIndex) -> Option<&[u8]> {
        let location = self.table.location(entity)?;
        self.archetypes[location.archetype as usize].component_data(component, location.row as usize)
    }

    /// The component payload of an entity, mutably. Only legal outside
    /// scheduled execution.
    pub fn get_component_mut(
        &mut self,
        entity: Entity,
        component: ComponentIndex,
    ) -> Option<&mut [u8]> {
        let location = self.table.location(entity)?;
        self.archetypes[location.archetype as usize]
            .component_data_mut(component, location.row as usize)
    }

    /// Entity arrays of every archetype whose mask contains `required` and
    /// avoids `forbidden`. No entity data is copied.
    pub fn entities_matching(
        &self,
        required: &ComponentMask,
        forbidden: Option<&ComponentMask>,
    ) -> Vec<ArchetypeMatch<'_>> {
        self.archetypes
            .iter()
            .enumerate()
            .filter(|(_, arch)| {
                !arch.is_empty()
                    && arch.mask().contains_all(required)
                    && forbidden.map(|f| !arch.mask().intersects(f)).unwrap_or(true)
            })
            .map(|(index, arch)| ArchetypeMatch {
                archetype: index as u32,
                entities: arch.entities(),
            })
            .collect()
    }

    pub(crate) fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub(crate) fn archetype_for_mask(&mut self, mask: &ComponentMask) -> Result<u32, EntityError> {
        if let Some(&index) = self.by_mask.get(mask) {
            return Ok(index);
        }
        for c in mask.iter() {
            self.registry.get_checked(c)?;
        }
        let index = self.archetypes.len() as u32;
        self.archetypes.push(Archetype::new(*mask, &self.registry));
        self.by_mask.insert(*mask, index);
        Ok(index)
    }

    fn component_callbacks<F>(
        &self,
        archetype: u32,
        select: impl Fn(&crate::component::ComponentCallbacks) -> F,
    ) -> Vec<(ComponentIndex, F)> {
        self.archetypes[archetype as usize]
            .components()
            .iter()
            .map(|&c| {
                (
                    c,
                    select(&self.registry.get(c).expect("registered").callbacks),
                )
            })
            .collect()
    }

    // -- persistence marks --------------------------------------------------

    /// Mark an entity persistent, assigning it a stable id in the
    /// gamestate namespace. Returns the persistent id (existing id if
    /// already marked).
    pub fn set_entity_persistence(&mut self, entity: Entity, mode: EntityPersistenceMode) -> u64 {
        if let Some(existing) = self.persistence.get_mut(&entity) {
            existing.mode = mode;
            return existing.persistent_id;
        }
        let persistent_id = self.next_persistent_id;
        self.next_persistent_id += 1;
        self.persistence.insert(
            entity,
            EntityPersistence {
                mode,
                persistent_id,
            },
        );
        persistent_id
    }

    /// Adopt a persistent id from an external source (gamestate restore).
    /// Freshly assigned ids keep clear of adopted ones.
    pub fn adopt_entity_persistence(
        &mut self,
        entity: Entity,
        mode: EntityPersistenceMode,
        persistent_id: u64,
    ) {
        self.next_persistent_id = self.next_persistent_id.max(persistent_id + 1);
        self.persistence.insert(
            entity,
            EntityPersistence {
                mode,
                persistent_id,
            },
        );
    }

    /// The persistence mark of an entity, if any.
    pub fn entity_persistence(&self, entity: Entity) -> Option<EntityPersistence> {
        self.persistence.get(&entity).copied()
    }

    /// All persistent entities with their marks.
    pub fn persistent_entities(&self) -> Vec<(Entity, EntityPersistence)> {
        let mut out: Vec<_> = self.persistence.iter().map(|(&e, &p)| (e, p)).collect();
        out.sort_by_key(|(_, p)| p.persistent_id);
        out
    }

    /// Persistent entities whose changes the network layer replicates.
    pub fn replicated_entities(&self) -> Vec<(Entity, EntityPersistence)> {
        self.persistent_entities()
            .into_iter()
            .filter(|(_, p)| p.mode == EntityPersistenceMode::PersistentReplicated)
            .collect()
    }

    // -- listeners & events -------------------------------------------------

    /// Register a listener for changes of (entity, component), owned by
    /// `owner`.
    pub fn listen(
        &self,
        entity: Entity,
        component: ComponentIndex,
        owner: u64,
        f: EntityListenerFn,
    ) {
        self.listeners.listen(entity, component, owner, f);
    }

    /// Synchronously notify listeners that `component` changed on the
    /// given entities.
    pub fn notify(&self, component: ComponentIndex, entities: &[Entity]) {
        self.listeners.notify(component, entities);
    }

    /// Register an event listener owned by `owner`.
    pub fn listen_event(&self, event: u64, owner: u64, f: EventListenerFn) {
        self.events.listen(event, owner, f);
    }

    /// Synchronously dispatch an event to its listeners.
    pub fn notify_event(&self, event: u64, entities: &[Entity], data: &[u8]) {
        self.events.notify(event, entities, data);
    }

    /// Remove every listener and event registration owned by `owner`.
    pub fn unlisten_all(&self, owner: u64) {
        self.listeners.unlisten_owner(owner);
        self.events.unlisten_owner(owner);
    }

    // -- command queue ------------------------------------------------------

    /// A command buffer wired to this context's component layout.
    pub fn create_command_buffer(&self) -> CommandBuffer {
        let sizes: Vec<usize> = self
            .registry
            .iter()
            .map(|(_, desc)| desc.bytes)
            .collect();
        CommandBuffer::new(Arc::from(sizes.into_boxed_slice()))
    }

    /// Drain a command buffer: creates first (resolving handles), then
    /// add/remove in submission order, then destroys, then clears.
    /// Lifecycle callbacks fire here, at the synchronization point.
    pub fn apply_commands(&mut self, buffer: CommandBuffer) {
        let mut created: Vec<Entity> = Vec::new();
        for command in &buffer.commands {
            match command {
                Command::CreateFromMask { mask } => match self.create_entity_from_mask(mask) {
                    Ok(entity) => created.push(entity),
                    Err(err) => {
                        warn!(%err, "queued create failed");
                        created.push(Entity::NONE);
                    }
                },
                Command::CreateFromAsset { asset } => {
                    match self.create_entity_from_asset(*asset) {
                        Ok(entity) => created.push(entity),
                        Err(err) => {
                            warn!(asset = ?asset, %err, "queued asset create failed");
                            created.push(Entity::NONE);
                        }
                    }
                }
                _ => {}
            }
        }

        let resolve = |target: &CommandTarget, created: &[Entity]| -> Entity {
            match target {
                CommandTarget::Entity(entity) => *entity,
                CommandTarget::Handle(handle) => created
                    .get(handle.0 as usize)
                    .copied()
                    .unwrap_or(Entity::NONE),
            }
        };

        // Duplicate add_component calls on one (entity, component) pair
        // within a queue are a caller bug; last write wins with a warning.
        let mut seen_adds: HashMap<(Entity, u16), u32> = HashMap::new();
        for command in &buffer.commands {
            if let Command::AddComponent { target, component, .. } = command {
                let entity = resolve(target, &created);
                let count = seen_adds.entry((entity, component.raw())).or_insert(0);
                *count += 1;
                if *count == 2 {
                    warn!(?entity, ?component, "add_component queued twice for the same entity");
                }
            }
        }

        for command in &buffer.commands {
            match command {
                Command::AddComponent {
                    target,
                    component,
                    data,
                } => {
                    let entity = resolve(target, &created);
                    if entity.is_none() {
                        warn!("queued add_component targets a failed create");
                        continue;
                    }
                    match self.add_component(entity, *component) {
                        Ok(slot) => {
                            let n = slot.len().min(data.len());
                            slot[..n].copy_from_slice(&data[..n]);
                        }
                        Err(err) => warn!(?entity, %err, "queued add_component failed"),
                    }
                }
                Command::RemoveComponent { target, component } => {
                    let entity = resolve(target, &created);
                    if entity.is_none() {
                        continue;
                    }
                    if let Err(err) = self.remove_component(entity, *component) {
                        warn!(?entity, %err, "queued remove_component failed");
                    }
                }
                _ => {}
            }
        }

        for command in &buffer.commands {
            if let Command::Destroy { entity } = command {
                if self.table.is_alive(*entity) {
                    self.destroy_entity(*entity);
                } else {
                    warn!(entity = ?entity, "queued destroy of dead entity ignored");
                }
            }
        }

        if buffer
            .commands
            .iter()
            .any(|c| matches!(c, Command::ClearWorld))
        {
            self.destroy_all_entities();
        }
    }
}

impl Drop for EntityContext {
    fn drop(&mut self) {
        // Initialized systems shut down with the context.
        let systems = std::mem::take(&mut self.systems);
        for system in systems {
            if !system.initialized {
                continue;
            }
            if let Some(shutdown) = system.desc.shutdown {
                self.run_system_fn(&shutdown);
            }
        }
    }
}

/// Split two distinct archetypes out of the table.
fn two_archetypes(archetypes: &mut [Archetype], a: u32, b: u32) -> (&mut Archetype, &mut Archetype) {
    assert_ne!(a, b, "archetype split requires distinct indices");
    if a < b {
        let (lo, hi) = archetypes.split_at_mut(b as usize);
        (&mut lo[a as usize], &mut hi[0])
    } else {
        let (lo, hi) = archetypes.split_at_mut(a as usize);
        (&mut hi[0], &mut lo[b as usize])
    }
}
