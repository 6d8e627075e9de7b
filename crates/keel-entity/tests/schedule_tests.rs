//! Scheduler end-to-end tests: conflict-driven ordering, parallelism
//! safety, soft ordering hints, filters, and system lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use keel_entity::prelude::*;
use keel_truth::hash::hash_name;
use keel_truth::store::Truth;

fn context_with_components(n: usize) -> (EntityContext, Vec<ComponentIndex>) {
    // Scheduler warnings (disabled engines, hint cycles) surface in test
    // output when RUST_LOG asks for them.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut ctx = EntityContext::new(Arc::new(Truth::new()));
    let components = (0..n)
        .map(|i| ctx.register_component(ComponentDesc::new(&format!("c{i}"), 8)))
        .collect();
    (ctx, components)
}

#[test]
fn conflicting_engines_never_run_concurrently() {
    let (mut ctx, comps) = context_with_components(3);
    let (a, b, c) = (comps[0], comps[1], comps[2]);

    // Entities carrying all three components, so every engine matches the
    // same archetype.
    let mask = ComponentMask::EMPTY.with(a).with(b).with(c);
    ctx.create_entities_from_mask(&mask, 16).unwrap();

    let x_running = Arc::new(AtomicBool::new(false));
    let y_running = Arc::new(AtomicBool::new(false));
    let z_running = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicU32::new(0));

    let make_engine = |name: &str,
                       components: Vec<ComponentIndex>,
                       writes: Vec<bool>,
                       mine: Arc<AtomicBool>,
                       conflicting: Vec<Arc<AtomicBool>>,
                       violations: Arc<AtomicU32>| {
        let written = writes.clone();
        EngineDesc::new(
            name,
            components,
            writes,
            Arc::new(move |update: &mut EngineUpdate<'_>| {
                mine.store(true, Ordering::SeqCst);
                for other in &conflicting {
                    if other.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
                for array in &mut update.arrays {
                    for (index, &writable) in written.iter().enumerate() {
                        if !writable {
                            continue;
                        }
                        for value in array.column_mut::<u64>(index) {
                            *value += 1;
                        }
                    }
                }
                mine.store(false, Ordering::SeqCst);
            }),
        )
    };

    // X writes a, reads b. Y reads b, writes c. Z writes a and c: it must
    // not overlap either X or Y.
    ctx.register_engine(make_engine(
        "engine_x",
        vec![a, b],
        vec![true, false],
        Arc::clone(&x_running),
        vec![Arc::clone(&z_running)],
        Arc::clone(&violations),
    ));
    ctx.register_engine(make_engine(
        "engine_y",
        vec![c, b],
        vec![true, false],
        Arc::clone(&y_running),
        vec![Arc::clone(&z_running)],
        Arc::clone(&violations),
    ));
    ctx.register_engine(make_engine(
        "engine_z",
        vec![a, c],
        vec![true, true],
        Arc::clone(&z_running),
        vec![Arc::clone(&x_running), Arc::clone(&y_running)],
        Arc::clone(&violations),
    ));

    for _ in 0..5 {
        ctx.update(&RayonJobSystem);
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);

    // Every engine ran on every tick: each write column accumulated 5.
    let entity = ctx.all_entities()[0];
    let a_bytes: [u8; 8] = ctx.get_component(entity, a).unwrap().try_into().unwrap();
    // a is written by X and Z.
    assert_eq!(u64::from_le_bytes(a_bytes), 10);
    let c_bytes: [u8; 8] = ctx.get_component(entity, c).unwrap().try_into().unwrap();
    // c is written by Y and Z.
    assert_eq!(u64::from_le_bytes(c_bytes), 10);
}

#[test]
fn data_independent_engines_keep_registration_order_serially() {
    let (mut ctx, comps) = context_with_components(2);
    let (a, b) = (comps[0], comps[1]);
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a).with(b), 1)
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    for (name, component) in [("first", a), ("second", b)] {
        let log = Arc::clone(&log);
        ctx.register_engine(EngineDesc::new(
            name,
            vec![component],
            vec![true],
            Arc::new(move |_update| {
                log.lock().unwrap().push(name.to_owned());
            }),
        ));
    }
    ctx.update(&SerialJobSystem);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn ordering_hints_reorder_independent_tasks() {
    let (mut ctx, comps) = context_with_components(2);
    let (a, b) = (comps[0], comps[1]);
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a).with(b), 1)
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));

    let log_early = Arc::clone(&log);
    ctx.register_engine(EngineDesc::new(
        "late",
        vec![a],
        vec![true],
        Arc::new(move |_| log_early.lock().unwrap().push("late")),
    ));

    // Registered after, but its hint puts it before "late".
    let log_late = Arc::clone(&log);
    let mut early = EngineDesc::new(
        "early",
        vec![b],
        vec![true],
        Arc::new(move |_| log_late.lock().unwrap().push("early")),
    );
    early.after_me = vec![hash_name("late")];
    ctx.register_engine(early);

    ctx.update(&SerialJobSystem);
    assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
}

#[test]
fn filter_overrides_default_matching() {
    let (mut ctx, comps) = context_with_components(2);
    let (a, b) = (comps[0], comps[1]);
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a), 2)
        .unwrap();
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a).with(b), 3)
        .unwrap();

    let visited = Arc::new(AtomicU32::new(0));
    let visited_clone = Arc::clone(&visited);
    let mut engine = EngineDesc::new(
        "filtered",
        vec![a],
        vec![false],
        Arc::new(move |update: &mut EngineUpdate<'_>| {
            for array in &update.arrays {
                visited_clone.fetch_add(array.count() as u32, Ordering::SeqCst);
            }
        }),
    );
    // Only archetypes that also carry b, although the engine reads a.
    engine.filter = Some(Arc::new(move |mask: &ComponentMask| mask.test(b)));
    ctx.register_engine(engine);

    ctx.update(&SerialJobSystem);
    assert_eq!(visited.load(Ordering::SeqCst), 3);
}

#[test]
fn excluded_components_skip_archetypes() {
    let (mut ctx, comps) = context_with_components(2);
    let (a, b) = (comps[0], comps[1]);
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a), 2)
        .unwrap();
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a).with(b), 3)
        .unwrap();

    let visited = Arc::new(AtomicU32::new(0));
    let visited_clone = Arc::clone(&visited);
    let mut engine = EngineDesc::new(
        "excluding",
        vec![a],
        vec![false],
        Arc::new(move |update: &mut EngineUpdate<'_>| {
            for array in &update.arrays {
                visited_clone.fetch_add(array.count() as u32, Ordering::SeqCst);
            }
        }),
    );
    engine.excluded = vec![b];
    ctx.register_engine(engine);

    ctx.update(&SerialJobSystem);
    assert_eq!(visited.load(Ordering::SeqCst), 2);
}

#[test]
fn engines_read_the_blackboard_snapshot() {
    let (mut ctx, comps) = context_with_components(1);
    let a = comps[0];
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a), 1)
        .unwrap();
    ctx.blackboard().set_double(*BLACKBOARD_DELTA_TIME, 0.25);

    let observed = Arc::new(Mutex::new(None));
    let observed_clone = Arc::clone(&observed);
    ctx.register_engine(EngineDesc::new(
        "reads_dt",
        vec![a],
        vec![false],
        Arc::new(move |update: &mut EngineUpdate<'_>| {
            *observed_clone.lock().unwrap() = update.blackboard_double(*BLACKBOARD_DELTA_TIME);
        }),
    ));
    ctx.update(&SerialJobSystem);
    assert_eq!(*observed.lock().unwrap(), Some(0.25));
}

#[test]
fn system_lifecycle_init_update_shutdown() {
    let (mut ctx, _comps) = context_with_components(1);

    let inits = Arc::new(AtomicU32::new(0));
    let updates = Arc::new(AtomicU32::new(0));
    let shutdowns = Arc::new(AtomicU32::new(0));

    let mut system = SystemDesc::new("lifecycle");
    let inits_clone = Arc::clone(&inits);
    system.init = Some(Arc::new(move |_| {
        inits_clone.fetch_add(1, Ordering::SeqCst);
    }));
    let updates_clone = Arc::clone(&updates);
    system.update = Some(Arc::new(move |_| {
        updates_clone.fetch_add(1, Ordering::SeqCst);
    }));
    let shutdowns_clone = Arc::clone(&shutdowns);
    system.shutdown = Some(Arc::new(move |_| {
        shutdowns_clone.fetch_add(1, Ordering::SeqCst);
    }));
    ctx.register_system(system);

    for _ in 0..3 {
        ctx.update(&SerialJobSystem);
    }
    assert_eq!(inits.load(Ordering::SeqCst), 1, "init runs exactly once");
    assert_eq!(updates.load(Ordering::SeqCst), 3);

    drop(ctx);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn engine_with_missing_component_is_disabled() {
    let (mut ctx, comps) = context_with_components(1);
    let a = comps[0];
    ctx.create_entities_from_mask(&ComponentMask::EMPTY.with(a), 1)
        .unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let ran_clone = Arc::clone(&ran);
    // Component index 9 was never registered.
    ctx.register_engine(EngineDesc::new(
        "ghost_engine",
        vec![a, ComponentIndex::from_raw(9)],
        vec![true, true],
        Arc::new(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }),
    ));
    ctx.update(&SerialJobSystem);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn hot_reload_reaches_every_system() {
    let (mut ctx, _comps) = context_with_components(1);
    let reloads = Arc::new(AtomicU32::new(0));
    for name in ["sys_a", "sys_b"] {
        let mut system = SystemDesc::new(name);
        let reloads_clone = Arc::clone(&reloads);
        system.hot_reload = Some(Arc::new(move |_| {
            reloads_clone.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.register_system(system);
    }
    ctx.hot_reload();
    assert_eq!(reloads.load(Ordering::SeqCst), 2);
}
