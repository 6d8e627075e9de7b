//! Component descriptors and the per-context registry.
//!
//! Components are raw byte records: a descriptor declares the payload size,
//! alignment, optional default bytes, lifecycle callbacks, and the
//! persistence metadata consumed by the gamestate bridge. The registry maps
//! name hashes to dense [`ComponentIndex`]es; at most [`MAX_COMPONENTS`]
//! components exist per context.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use keel_truth::object::ObjectId;
use keel_truth::store::Truth;

use crate::entity::Entity;
use crate::mask::MAX_COMPONENTS;
use crate::EntityError;

// ---------------------------------------------------------------------------
// ComponentIndex
// ---------------------------------------------------------------------------

/// Dense index of a registered component. At most 1023.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentIndex(pub(crate) u16);

impl ComponentIndex {
    /// Raw dense index.
    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Reconstruct from a raw index (serialized schedules, tooling). The
    /// index is validated at use sites, not here.
    #[inline]
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for ComponentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentIndex({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Lifecycle callback on a single entity's component payload.
pub type ComponentFn = Arc<dyn Fn(Entity, &mut [u8]) + Send + Sync>;

/// Initializes a component payload from a Truth asset object.
pub type LoadAssetFn = Arc<dyn Fn(&Truth, ObjectId, &mut [u8]) + Send + Sync>;

/// Called once when the registry is finalized.
pub type ComponentsCreatedFn = Arc<dyn Fn(ComponentIndex) + Send + Sync>;

/// The optional lifecycle callbacks of a component.
#[derive(Clone, Default)]
pub struct ComponentCallbacks {
    /// Fired by `create_components` once the component has its index.
    pub components_created: Option<ComponentsCreatedFn>,
    /// Initializes payload bytes from an asset object.
    pub load_asset: Option<LoadAssetFn>,
    /// Fired after a gamestate restore or asset reload.
    pub asset_reloaded: Option<ComponentFn>,
    /// Fired when the component is added to an entity.
    pub add: Option<ComponentFn>,
    /// Fired when the component is removed from an entity.
    pub remove: Option<ComponentFn>,
    /// Fired when the owning entity is destroyed.
    pub destroy: Option<ComponentFn>,
}

impl fmt::Debug for ComponentCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCallbacks")
            .field("components_created", &self.components_created.is_some())
            .field("load_asset", &self.load_asset.is_some())
            .field("asset_reloaded", &self.asset_reloaded.is_some())
            .field("add", &self.add.is_some())
            .field("remove", &self.remove.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Persistence metadata
// ---------------------------------------------------------------------------

/// A named byte range of a component payload.
#[derive(Debug, Clone)]
pub struct MemberDef {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Serializes a component payload for the gamestate.
pub type GamestateSerializeFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Restores a component payload from its gamestate bytes.
pub type GamestateDeserializeFn = Arc<dyn Fn(&[u8], &mut [u8]) + Send + Sync>;

/// Content hash of a component payload; overrides raw-byte hashing.
pub type ComputeHashFn = Arc<dyn Fn(Entity, &[u8]) -> u64 + Send + Sync>;

/// How a component projects into the gamestate.
#[derive(Clone)]
pub struct GamestateRepr {
    /// Size of the serialized representation (0 = variable).
    pub size: usize,
    pub serialize: Option<GamestateSerializeFn>,
    pub deserialize: Option<GamestateDeserializeFn>,
    pub compute_hash: Option<ComputeHashFn>,
    pub members: Vec<MemberDef>,
    /// Components restore in ascending order of this key.
    pub restore_sort_order: u32,
    /// Serialize only when the gamestate is actually saved.
    pub lazy_serialization: bool,
}

impl Default for GamestateRepr {
    fn default() -> Self {
        Self {
            size: 0,
            serialize: None,
            deserialize: None,
            compute_hash: None,
            members: Vec::new(),
            restore_sort_order: 0,
            lazy_serialization: false,
        }
    }
}

impl fmt::Debug for GamestateRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GamestateRepr")
            .field("size", &self.size)
            .field("restore_sort_order", &self.restore_sort_order)
            .field("lazy_serialization", &self.lazy_serialization)
            .field("members", &self.members.len())
            .finish()
    }
}

/// Persistence tracking configuration.
#[derive(Debug, Clone, Default)]
pub struct PersistenceDef {
    /// When true, the automatic change walk skips this component; the
    /// component pushes to the gamestate through its own path.
    pub manual_tracking: bool,
    pub members: Vec<MemberDef>,
}

/// Per-member replication settings.
#[derive(Debug, Clone)]
pub struct MemberReplication {
    /// Seconds between change scans for this member; overrides the
    /// component-wide timer.
    pub watch_timer: f64,
    /// Whether the member must arrive (reliable channel).
    pub reliable: bool,
}

/// Network replication configuration. Carried as data for the network
/// layer; the core only enumerates replicated entities.
#[derive(Debug, Clone, Default)]
pub struct ReplicationDef {
    /// Seconds between change scans on the replicating side.
    pub watch_timer: f64,
    pub members: Vec<MemberDef>,
    /// Parallel to `members`; empty means component-wide defaults.
    pub member_replication: Vec<MemberReplication>,
}

// ---------------------------------------------------------------------------
// ComponentDesc
// ---------------------------------------------------------------------------

/// Descriptor of a component type.
#[derive(Clone)]
pub struct ComponentDesc {
    pub name: String,
    pub name_hash: u64,
    /// Payload size in bytes; 0 makes a tag component.
    pub bytes: usize,
    /// Natural alignment of the payload.
    pub align: usize,
    /// Initial payload for new rows; zeroed when absent.
    pub default_data: Option<Vec<u8>>,
    pub callbacks: ComponentCallbacks,
    pub gamestate: Option<GamestateRepr>,
    pub persistence: Option<PersistenceDef>,
    pub replication: Option<ReplicationDef>,
    /// Whether the component participates in editor contexts
    /// (registration mode `Editor`).
    pub editor: bool,
}

impl ComponentDesc {
    /// A component with the given payload size and 8-byte alignment.
    pub fn new(name: &str, bytes: usize) -> Self {
        Self {
            name: name.to_owned(),
            name_hash: keel_truth::hash::hash_name(name),
            bytes,
            align: if bytes == 0 { 1 } else { 8 },
            default_data: None,
            callbacks: ComponentCallbacks::default(),
            gamestate: None,
            persistence: None,
            replication: None,
            editor: true,
        }
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn with_default_data(mut self, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.bytes);
        self.default_data = Some(data);
        self
    }

    pub fn with_callbacks(mut self, callbacks: ComponentCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_gamestate(mut self, gamestate: GamestateRepr) -> Self {
        self.gamestate = Some(gamestate);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceDef) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_replication(mut self, replication: ReplicationDef) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn runtime_only(mut self) -> Self {
        self.editor = false;
        self
    }
}

impl fmt::Debug for ComponentDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDesc")
            .field("name", &self.name)
            .field("bytes", &self.bytes)
            .field("align", &self.align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// How `create_components` populates a context's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRegistrationMode {
    /// Register every interface component.
    All,
    /// Register only components flagged for editor contexts.
    Editor,
    /// Register nothing; the caller registers components explicitly.
    None,
}

/// Dense table of component descriptors plus a name-hash index.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    descs: Vec<ComponentDesc>,
    by_hash: HashMap<u64, ComponentIndex>,
    disabled: HashSet<u64>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Re-registering the same name hash returns the
    /// existing index.
    ///
    /// # Panics
    ///
    /// Panics when the [`MAX_COMPONENTS`] limit would be exceeded.
    pub fn register(&mut self, desc: ComponentDesc) -> ComponentIndex {
        if let Some(&existing) = self.by_hash.get(&desc.name_hash) {
            return existing;
        }
        assert!(
            self.descs.len() < MAX_COMPONENTS,
            "component limit ({MAX_COMPONENTS}) exceeded registering '{}'",
            desc.name
        );
        let index = ComponentIndex(self.descs.len() as u16);
        self.by_hash.insert(desc.name_hash, index);
        self.descs.push(desc);
        index
    }

    /// Exclude a component from a later
    /// [`create_components`](Self::create_components) call.
    pub fn disable_component(&mut self, name_hash: u64) {
        self.disabled.insert(name_hash);
    }

    /// Populate the registry from an interface list according to `mode`,
    /// honoring disabled components and firing `components_created`.
    pub fn create_components(
        &mut self,
        mode: ComponentRegistrationMode,
        interfaces: &[ComponentDesc],
    ) {
        if mode == ComponentRegistrationMode::None {
            return;
        }
        for desc in interfaces {
            if self.disabled.contains(&desc.name_hash) {
                continue;
            }
            if mode == ComponentRegistrationMode::Editor && !desc.editor {
                continue;
            }
            let index = self.register(desc.clone());
            if let Some(cb) = &self.descs[index.0 as usize].callbacks.components_created {
                cb(index);
            }
        }
    }

    /// Look up a component by name hash.
    pub fn lookup(&self, name_hash: u64) -> Option<ComponentIndex> {
        self.by_hash.get(&name_hash).copied()
    }

    /// The descriptor of `index`.
    pub fn get(&self, index: ComponentIndex) -> Option<&ComponentDesc> {
        self.descs.get(index.0 as usize)
    }

    /// Descriptor lookup that reports the failure.
    pub fn get_checked(&self, index: ComponentIndex) -> Result<&ComponentDesc, EntityError> {
        self.descs
            .get(index.0 as usize)
            .ok_or(EntityError::UnknownComponent {
                name_hash: index.0 as u64,
            })
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Iterate `(index, descriptor)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ComponentIndex, &ComponentDesc)> {
        self.descs
            .iter()
            .enumerate()
            .map(|(i, d)| (ComponentIndex(i as u16), d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new();
        let desc = ComponentDesc::new("position", 8);
        let hash = desc.name_hash;
        let index = reg.register(desc);
        assert_eq!(reg.lookup(hash), Some(index));
        assert_eq!(reg.get(index).unwrap().bytes, 8);
    }

    #[test]
    fn reregistering_same_name_returns_existing() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register(ComponentDesc::new("position", 8));
        let b = reg.register(ComponentDesc::new("position", 8));
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn create_components_honors_mode_and_disable() {
        let interfaces = vec![
            ComponentDesc::new("a", 4),
            ComponentDesc::new("b", 4).runtime_only(),
            ComponentDesc::new("c", 4),
        ];
        let disabled_hash = interfaces[2].name_hash;

        let mut all = ComponentRegistry::new();
        all.disable_component(disabled_hash);
        all.create_components(ComponentRegistrationMode::All, &interfaces);
        assert_eq!(all.len(), 2); // a + b, c disabled

        let mut editor = ComponentRegistry::new();
        editor.create_components(ComponentRegistrationMode::Editor, &interfaces);
        assert_eq!(editor.len(), 2); // a + c, b is runtime-only

        let mut none = ComponentRegistry::new();
        none.create_components(ComponentRegistrationMode::None, &interfaces);
        assert!(none.is_empty());
    }

    #[test]
    fn components_created_fires_with_final_index() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let fired = Arc::new(AtomicU32::new(u32::MAX));
        let fired_clone = Arc::clone(&fired);
        let mut desc = ComponentDesc::new("tracked", 4);
        desc.callbacks.components_created = Some(Arc::new(move |index| {
            fired_clone.store(index.raw() as u32, Ordering::SeqCst);
        }));

        let mut reg = ComponentRegistry::new();
        reg.create_components(ComponentRegistrationMode::All, &[desc]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
