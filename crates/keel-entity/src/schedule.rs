//! Engine and system scheduling.
//!
//! Each update tick builds a task graph: one task per engine per matching
//! archetype, one task per system. Tasks that touch a common component
//! where either side writes it, on overlapping rows, are ordered by an
//! edge (earlier registration first); `exclusive` tasks conflict with
//! everything. `before_me`/`after_me`/`phase` add soft ordering edges that
//! never substitute for the derived data hazards. Tasks execute wave by
//! wave on a caller-provided [`JobSystem`] and queue structural changes
//! into per-task command buffers, drained in submission order after the
//! last wave.
//!
//! # Safety
//!
//! Engine tasks receive raw column pointers. The conflict analysis is the
//! aliasing argument: two tasks may run in the same wave only if no
//! component column is written by one and touched by the other on the
//! same archetype, so every raw access within a wave is either read-only
//! shared or exclusive.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use keel_truth::hash::hash_name;

use crate::commands::CommandBuffer;
use crate::component::ComponentIndex;
use crate::context::EntityContext;
use crate::entity::Entity;
use crate::mask::ComponentMask;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Overrides the default archetype inclusion test of an engine.
pub type EngineFilterFn = Arc<dyn Fn(&ComponentMask) -> bool + Send + Sync>;

/// An engine's per-archetype update function.
pub type EngineUpdateFn = Arc<dyn Fn(&mut EngineUpdate<'_>) + Send + Sync>;

/// A system lifecycle function.
pub type SystemFn = Arc<dyn Fn(&mut SystemContext<'_>) + Send + Sync>;

/// A parallel update over component columns of matching archetypes.
pub struct EngineDesc {
    pub name: String,
    /// Identity in the schedule; defaults to the name hash.
    pub hash: u64,
    /// Optional phase hash this engine belongs to.
    pub phase: u64,
    /// Hashes (task or phase) that must be scheduled before this engine.
    pub before_me: Vec<u64>,
    /// Hashes (task or phase) that must be scheduled after this engine.
    pub after_me: Vec<u64>,
    /// Components the engine accesses; column order in the update set.
    pub components: Vec<ComponentIndex>,
    /// Parallel to `components`: whether the column is written.
    pub writes: Vec<bool>,
    /// Archetypes containing any of these are skipped (ignored when
    /// `filter` is set).
    pub excluded: Vec<ComponentIndex>,
    /// Conflict with every other task.
    pub exclusive: bool,
    /// Custom archetype inclusion test.
    pub filter: Option<EngineFilterFn>,
    pub update: EngineUpdateFn,
}

impl EngineDesc {
    pub fn new(
        name: &str,
        components: Vec<ComponentIndex>,
        writes: Vec<bool>,
        update: EngineUpdateFn,
    ) -> Self {
        Self {
            name: name.to_owned(),
            hash: hash_name(name),
            phase: 0,
            before_me: Vec::new(),
            after_me: Vec::new(),
            components,
            writes,
            excluded: Vec::new(),
            exclusive: false,
            filter: None,
            update,
        }
    }
}

/// A scheduled update without direct column access; systems reach into
/// the context for data and mutate through commands.
pub struct SystemDesc {
    pub name: String,
    pub hash: u64,
    pub phase: u64,
    pub before_me: Vec<u64>,
    pub after_me: Vec<u64>,
    /// Components the system reads/writes through the context, for
    /// conflict analysis. A system declaring none is scheduled
    /// exclusively.
    pub components: Vec<ComponentIndex>,
    pub writes: Vec<bool>,
    pub exclusive: bool,
    pub init: Option<SystemFn>,
    pub update: Option<SystemFn>,
    pub shutdown: Option<SystemFn>,
    pub hot_reload: Option<SystemFn>,
}

impl SystemDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            hash: hash_name(name),
            phase: 0,
            before_me: Vec::new(),
            after_me: Vec::new(),
            components: Vec::new(),
            writes: Vec::new(),
            exclusive: false,
            init: None,
            update: None,
            shutdown: None,
            hot_reload: None,
        }
    }
}

pub(crate) struct SystemState {
    pub(crate) desc: SystemDesc,
    pub(crate) initialized: bool,
}

// ---------------------------------------------------------------------------
// Update views
// ---------------------------------------------------------------------------

struct ColumnAccess {
    ptr: *mut u8,
    stride: usize,
    writable: bool,
}

/// One archetype's rows, exposed as the engine's declared columns.
pub struct EngineUpdateArray<'a> {
    entities: &'a [Entity],
    columns: Vec<ColumnAccess>,
    count: usize,
}

impl<'a> EngineUpdateArray<'a> {
    /// Row-ordered entity ids.
    #[inline]
    pub fn entities(&self) -> &'a [Entity] {
        self.entities
    }

    /// Number of rows.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The column declared at `index` in the engine's `components`, as a
    /// typed slice. Empty when the archetype lacks the component.
    ///
    /// # Panics
    ///
    /// Panics if `size_of::<T>()` does not match the component stride.
    pub fn column<T: Copy>(&self, index: usize) -> &[T] {
        let access = &self.columns[index];
        if access.ptr.is_null() || self.count == 0 {
            return &[];
        }
        assert_eq!(
            std::mem::size_of::<T>(),
            access.stride,
            "column type size does not match component stride"
        );
        // Safety: the scheduler granted this task the column; the buffer
        // holds `count` initialized rows.
        unsafe { std::slice::from_raw_parts(access.ptr as *const T, self.count) }
    }

    /// Writable variant of [`column`](Self::column).
    ///
    /// # Panics
    ///
    /// Panics if the column was not declared written, or on a stride
    /// mismatch.
    pub fn column_mut<T: Copy>(&mut self, index: usize) -> &mut [T] {
        let access = &self.columns[index];
        assert!(access.writable, "column was not declared written");
        if access.ptr.is_null() || self.count == 0 {
            return &mut [];
        }
        assert_eq!(
            std::mem::size_of::<T>(),
            access.stride,
            "column type size does not match component stride"
        );
        // Safety: as in `column`, plus the conflict analysis guarantees no
        // concurrent access to a written column.
        unsafe { std::slice::from_raw_parts_mut(access.ptr as *mut T, self.count) }
    }

    /// Raw pointer and stride of a declared column.
    pub fn raw_column(&self, index: usize) -> (*mut u8, usize) {
        let access = &self.columns[index];
        (access.ptr, access.stride)
    }
}

/// The per-task view handed to an engine update.
pub struct EngineUpdate<'a> {
    pub arrays: Vec<EngineUpdateArray<'a>>,
    /// Numeric blackboard entries snapshotted for this tick.
    pub blackboard: &'a [(u64, f64)],
    pub commands: &'a mut CommandBuffer,
}

impl EngineUpdate<'_> {
    /// A numeric blackboard entry from the tick snapshot.
    pub fn blackboard_double(&self, key: u64) -> Option<f64> {
        self.blackboard
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

/// The per-task view handed to a system function.
pub struct SystemContext<'a> {
    /// Shared view of the context. The system must confine its component
    /// access to its declared read/write sets; structural mutation goes
    /// through `commands`.
    pub ctx: &'a EntityContext,
    pub commands: &'a mut CommandBuffer,
    pub blackboard: &'a [(u64, f64)],
}

impl SystemContext<'_> {
    /// A numeric blackboard entry from the tick snapshot.
    pub fn blackboard_double(&self, key: u64) -> Option<f64> {
        self.blackboard
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

// ---------------------------------------------------------------------------
// Job system
// ---------------------------------------------------------------------------

/// Runs one wave of independent jobs to completion.
pub trait JobSystem: Sync {
    fn run_batch<'a>(&self, jobs: Vec<Box<dyn FnOnce() + Send + 'a>>);
}

/// Work-stealing execution on the global rayon pool.
pub struct RayonJobSystem;

impl JobSystem for RayonJobSystem {
    fn run_batch<'a>(&self, jobs: Vec<Box<dyn FnOnce() + Send + 'a>>) {
        rayon::scope(|scope| {
            for job in jobs {
                scope.spawn(move |_| job());
            }
        });
    }
}

/// In-order execution on the calling thread (tests, single-core hosts).
pub struct SerialJobSystem;

impl JobSystem for SerialJobSystem {
    fn run_batch<'a>(&self, jobs: Vec<Box<dyn FnOnce() + Send + 'a>>) {
        for job in jobs {
            job();
        }
    }
}

// ---------------------------------------------------------------------------
// Task graph
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum TaskKind {
    Engine { engine: usize, archetype: u32 },
    System { system: usize },
}

struct TaskSpec {
    kind: TaskKind,
    hash: u64,
    phase: u64,
    reads: ComponentMask,
    writes: ComponentMask,
    exclusive: bool,
    archetype: Option<u32>,
}

impl TaskSpec {
    fn uses(&self) -> ComponentMask {
        let mut mask = self.reads;
        for c in self.writes.iter() {
            mask.set(c);
        }
        mask
    }
}

fn data_conflict(a: &TaskSpec, b: &TaskSpec) -> bool {
    if a.exclusive || b.exclusive {
        return true;
    }
    let hazard = a.writes.intersects(&b.uses()) || b.writes.intersects(&a.uses());
    if !hazard {
        return false;
    }
    // Engine tasks on different archetypes touch disjoint rows.
    match (a.archetype, b.archetype) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn matches_hint(task: &TaskSpec, hint: u64) -> bool {
    hint != 0 && (task.hash == hint || task.phase == hint)
}

/// Longest-path layering of the task graph. Returns waves of task
/// indices, or `None` when the edges contain a cycle.
fn layer_tasks(count: usize, edges: &[(usize, usize)]) -> Option<Vec<Vec<usize>>> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut indegree = vec![0usize; count];
    for &(from, to) in edges {
        successors[from].push(to);
        indegree[to] += 1;
    }
    let mut level = vec![0usize; count];
    let mut queue: VecDeque<usize> = (0..count).filter(|&t| indegree[t] == 0).collect();
    let mut processed = 0;
    while let Some(task) = queue.pop_front() {
        processed += 1;
        for &next in &successors[task] {
            level[next] = level[next].max(level[task] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if processed != count {
        return None;
    }
    let depth = level.iter().copied().max().map(|d| d + 1).unwrap_or(0);
    let mut waves = vec![Vec::new(); depth];
    for (task, &l) in level.iter().enumerate() {
        waves[l].push(task);
    }
    Some(waves)
}

// An update array contains raw column pointers; moving it into a job is
// sound because the scheduler's conflict analysis guarantees that no two
// concurrently running tasks access a written column of the same
// archetype.
struct TaskPayload<'a>(EngineUpdateArray<'a>);

#[allow(unsafe_code)]
unsafe impl Send for TaskPayload<'_> {}

// ---------------------------------------------------------------------------
// Context integration
// ---------------------------------------------------------------------------

impl EntityContext {
    /// Register (or replace, by hash) a scheduled engine. An engine
    /// referencing unregistered components is disabled: it is not added
    /// to the schedule.
    pub fn register_engine(&mut self, desc: EngineDesc) {
        let limit = self.registry().len() as u16;
        let invalid = desc
            .components
            .iter()
            .chain(desc.excluded.iter())
            .any(|c| c.raw() >= limit);
        if invalid {
            info!(engine = %desc.name, "engine references unavailable components; disabled");
            return;
        }
        if desc.writes.len() != desc.components.len() {
            warn!(engine = %desc.name, "writes[] length does not match components[]; missing entries read-only");
        }
        if let Some(existing) = self.engines.iter_mut().find(|e| e.hash == desc.hash) {
            *existing = desc;
        } else {
            self.engines.push(desc);
        }
    }

    /// Remove an engine between ticks.
    pub fn unregister_engine(&mut self, hash: u64) {
        self.engines.retain(|e| e.hash != hash);
    }

    /// Register (or replace, by hash) a scheduled system. `init` runs
    /// exactly once before the system's first update.
    pub fn register_system(&mut self, desc: SystemDesc) {
        let limit = self.registry().len() as u16;
        if desc.components.iter().any(|c| c.raw() >= limit) {
            info!(system = %desc.name, "system references unavailable components; disabled");
            return;
        }
        if let Some(existing) = self.systems.iter_mut().find(|s| s.desc.hash == desc.hash) {
            existing.desc = desc;
            existing.initialized = false;
        } else {
            self.systems.push(SystemState {
                desc,
                initialized: false,
            });
        }
    }

    /// Remove a system, running its `shutdown` if it was initialized.
    pub fn unregister_system(&mut self, hash: u64) {
        let Some(position) = self.systems.iter().position(|s| s.desc.hash == hash) else {
            return;
        };
        let system = self.systems.remove(position);
        if system.initialized {
            if let Some(shutdown) = system.desc.shutdown {
                self.run_system_fn(&shutdown);
            }
        }
    }

    /// Invoke every system's `hot_reload` after a code reload.
    pub fn hot_reload(&mut self) {
        let callbacks: Vec<SystemFn> = self
            .systems
            .iter()
            .filter_map(|s| s.desc.hot_reload.clone())
            .collect();
        for callback in callbacks {
            self.run_system_fn(&callback);
        }
    }

    pub(crate) fn run_system_fn(&mut self, f: &SystemFn) {
        let blackboard = self.blackboard().doubles_snapshot();
        let mut commands = self.create_command_buffer();
        {
            let mut system_ctx = SystemContext {
                ctx: self,
                commands: &mut commands,
                blackboard: &blackboard,
            };
            f(&mut system_ctx);
        }
        self.apply_commands(commands);
    }

    /// Run one tick: initialize pending systems, build the task graph,
    /// execute it on `jobs`, then drain the command queues.
    pub fn update(&mut self, jobs: &dyn JobSystem) {
        // Pending system inits run serially before the graph.
        for index in 0..self.systems.len() {
            if self.systems[index].initialized {
                continue;
            }
            self.systems[index].initialized = true;
            if let Some(init) = self.systems[index].desc.init.clone() {
                self.run_system_fn(&init);
            }
        }

        let blackboard = self.blackboard().doubles_snapshot();
        let tasks = self.build_tasks();
        if tasks.is_empty() {
            return;
        }
        let waves = self.layer_with_hints(&tasks);

        let collected: Mutex<Vec<(usize, CommandBuffer)>> = Mutex::new(Vec::new());
        {
            let this: &EntityContext = &*self;
            for wave in &waves {
                let mut batch: Vec<Box<dyn FnOnce() + Send + '_>> = Vec::new();
                for &task_index in wave {
                    let spec = &tasks[task_index];
                    let collected = &collected;
                    let blackboard = &blackboard;
                    match spec.kind {
                        TaskKind::Engine { engine, archetype } => {
                            let desc = &this.engines[engine];
                            let update = Arc::clone(&desc.update);
                            let payload = TaskPayload(build_engine_array(this, desc, archetype));
                            let mut commands = this.create_command_buffer();
                            batch.push(Box::new(move || {
                                let payload = payload;
                                let mut update_set = EngineUpdate {
                                    arrays: vec![payload.0],
                                    blackboard,
                                    commands: &mut commands,
                                };
                                update(&mut update_set);
                                collected
                                    .lock()
                                    .expect("command collection poisoned")
                                    .push((task_index, commands));
                            }));
                        }
                        TaskKind::System { system } => {
                            let Some(run) = this.systems[system].desc.update.clone() else {
                                continue;
                            };
                            let mut commands = this.create_command_buffer();
                            batch.push(Box::new(move || {
                                let mut system_ctx = SystemContext {
                                    ctx: this,
                                    commands: &mut commands,
                                    blackboard,
                                };
                                run(&mut system_ctx);
                                collected
                                    .lock()
                                    .expect("command collection poisoned")
                                    .push((task_index, commands));
                            }));
                        }
                    }
                }
                jobs.run_batch(batch);
            }
        }

        // Drain per-task buffers in submission order.
        let mut buffers = collected.into_inner().expect("command collection poisoned");
        buffers.sort_by_key(|(task_index, _)| *task_index);
        let mut merged = self.create_command_buffer();
        for (_, buffer) in buffers {
            merged.merge(buffer);
        }
        self.apply_commands(merged);
    }

    fn build_tasks(&self) -> Vec<TaskSpec> {
        let mut tasks = Vec::new();
        for (engine_index, engine) in self.engines.iter().enumerate() {
            let required = ComponentMask::from_components(&engine.components);
            let excluded = ComponentMask::from_components(&engine.excluded);
            let mut writes = ComponentMask::EMPTY;
            let mut reads = ComponentMask::EMPTY;
            for (i, &c) in engine.components.iter().enumerate() {
                if engine.writes.get(i).copied().unwrap_or(false) {
                    writes.set(c);
                } else {
                    reads.set(c);
                }
            }
            for (archetype_index, archetype) in self.archetypes().iter().enumerate() {
                if archetype.is_empty() {
                    continue;
                }
                let included = match &engine.filter {
                    Some(filter) => filter(archetype.mask()),
                    None => {
                        archetype.mask().contains_all(&required)
                            && !archetype.mask().intersects(&excluded)
                    }
                };
                if !included {
                    continue;
                }
                tasks.push(TaskSpec {
                    kind: TaskKind::Engine {
                        engine: engine_index,
                        archetype: archetype_index as u32,
                    },
                    hash: engine.hash,
                    phase: engine.phase,
                    reads,
                    writes,
                    exclusive: engine.exclusive,
                    archetype: Some(archetype_index as u32),
                });
            }
        }
        for (system_index, system) in self.systems.iter().enumerate() {
            if system.desc.update.is_none() {
                continue;
            }
            let mut writes = ComponentMask::EMPTY;
            let mut reads = ComponentMask::EMPTY;
            for (i, &c) in system.desc.components.iter().enumerate() {
                if system.desc.writes.get(i).copied().unwrap_or(false) {
                    writes.set(c);
                } else {
                    reads.set(c);
                }
            }
            // An undeclared access set makes the system exclusive.
            let exclusive = system.desc.exclusive || system.desc.components.is_empty();
            tasks.push(TaskSpec {
                kind: TaskKind::System {
                    system: system_index,
                },
                hash: system.desc.hash,
                phase: system.desc.phase,
                reads,
                writes,
                exclusive,
                archetype: None,
            });
        }
        tasks
    }

    fn layer_with_hints(&self, tasks: &[TaskSpec]) -> Vec<Vec<usize>> {
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for i in 0..tasks.len() {
            for j in (i + 1)..tasks.len() {
                if data_conflict(&tasks[i], &tasks[j]) {
                    edges.push((i, j));
                }
            }
        }
        let data_edge_count = edges.len();

        // Soft ordering hints; they add edges but never remove hazards.
        for (i, task) in tasks.iter().enumerate() {
            let (before_me, after_me) = match task.kind {
                TaskKind::Engine { engine, .. } => (
                    &self.engines[engine].before_me,
                    &self.engines[engine].after_me,
                ),
                TaskKind::System { system } => (
                    &self.systems[system].desc.before_me,
                    &self.systems[system].desc.after_me,
                ),
            };
            for (j, other) in tasks.iter().enumerate() {
                if i == j {
                    continue;
                }
                if before_me.iter().any(|&h| matches_hint(other, h)) {
                    edges.push((j, i));
                }
                if after_me.iter().any(|&h| matches_hint(other, h)) {
                    edges.push((i, j));
                }
            }
        }

        match layer_tasks(tasks.len(), &edges) {
            Some(waves) => waves,
            None => {
                warn!("ordering hints form a cycle; falling back to data hazards only");
                edges.truncate(data_edge_count);
                layer_tasks(tasks.len(), &edges)
                    .expect("data hazard edges are acyclic by registration order")
            }
        }
    }
}

fn build_engine_array<'a>(
    ctx: &'a EntityContext,
    engine: &EngineDesc,
    archetype: u32,
) -> EngineUpdateArray<'a> {
    let arch = &ctx.archetypes()[archetype as usize];
    let columns = engine
        .components
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            // Safety: the pointer is only used by this task, under the
            // scheduler's conflict analysis.
            #[allow(unsafe_code)]
            let (ptr, stride) =
                unsafe { arch.column_raw(c) }.unwrap_or((std::ptr::null_mut(), 0));
            ColumnAccess {
                ptr,
                stride,
                writable: engine.writes.get(i).copied().unwrap_or(false),
            }
        })
        .collect();
    EngineUpdateArray {
        entities: arch.entities(),
        columns,
        count: arch.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(writes: &[u16], reads: &[u16], archetype: Option<u32>) -> TaskSpec {
        let mut w = ComponentMask::EMPTY;
        for &c in writes {
            w.set(ComponentIndex(c));
        }
        let mut r = ComponentMask::EMPTY;
        for &c in reads {
            r.set(ComponentIndex(c));
        }
        TaskSpec {
            kind: TaskKind::System { system: 0 },
            hash: 0,
            phase: 0,
            reads: r,
            writes: w,
            exclusive: false,
            archetype,
        }
    }

    #[test]
    fn writer_reader_conflict_on_same_archetype() {
        let a = spec(&[0], &[1], Some(0));
        let b = spec(&[2], &[0], Some(0));
        assert!(data_conflict(&a, &b));
    }

    #[test]
    fn disjoint_components_never_conflict() {
        let a = spec(&[0], &[1], Some(0));
        let b = spec(&[2], &[3], Some(0));
        assert!(!data_conflict(&a, &b));
    }

    #[test]
    fn different_archetypes_do_not_conflict() {
        let a = spec(&[0], &[], Some(0));
        let b = spec(&[0], &[], Some(1));
        assert!(!data_conflict(&a, &b));
    }

    #[test]
    fn readers_share_freely() {
        let a = spec(&[], &[0], Some(0));
        let b = spec(&[], &[0], Some(0));
        assert!(!data_conflict(&a, &b));
    }

    #[test]
    fn exclusive_conflicts_with_everything() {
        let mut a = spec(&[], &[], Some(0));
        a.exclusive = true;
        let b = spec(&[5], &[], Some(9));
        assert!(data_conflict(&a, &b));
    }

    #[test]
    fn layering_respects_edges() {
        // 0 -> 1 -> 3, 0 -> 2
        let waves = layer_tasks(4, &[(0, 1), (1, 3), (0, 2)]).unwrap();
        assert_eq!(waves, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn layering_detects_cycles() {
        assert!(layer_tasks(2, &[(0, 1), (1, 0)]).is_none());
    }
}
