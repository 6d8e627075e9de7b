//! Component listeners and the event bus.
//!
//! Listeners are registered per (entity, component) pair or per event
//! hash, owned by an opaque `owner` token so a module can drop all of its
//! registrations at once. Dispatch is synchronous on the notifying thread
//! and snapshots the listener list at entry, so listeners may register or
//! remove listeners (including themselves) during a notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::component::ComponentIndex;
use crate::entity::Entity;

/// Callback for a changed (entity, component) pair.
pub type EntityListenerFn = Arc<dyn Fn(Entity) + Send + Sync>;

/// Callback for an event: the affected entities and an opaque payload.
pub type EventListenerFn = Arc<dyn Fn(&[Entity], &[u8]) + Send + Sync>;

struct Registration<F> {
    owner: u64,
    callback: F,
}

// ---------------------------------------------------------------------------
// ListenerTable
// ---------------------------------------------------------------------------

/// Per-(entity, component) listener lists.
#[derive(Default)]
pub struct ListenerTable {
    listeners: Mutex<HashMap<(Entity, u16), Vec<Registration<EntityListenerFn>>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, entity: Entity, component: ComponentIndex, owner: u64, f: EntityListenerFn) {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .entry((entity, component.raw()))
            .or_default()
            .push(Registration {
                owner,
                callback: f,
            });
    }

    /// Synchronously invoke the listeners of every (entity, component)
    /// pair in `entities`.
    pub fn notify(&self, component: ComponentIndex, entities: &[Entity]) {
        for &entity in entities {
            let snapshot: Vec<EntityListenerFn> = {
                let listeners = self.listeners.lock().expect("listener table poisoned");
                match listeners.get(&(entity, component.raw())) {
                    Some(list) => list.iter().map(|r| Arc::clone(&r.callback)).collect(),
                    None => continue,
                }
            };
            for callback in snapshot {
                callback(entity);
            }
        }
    }

    /// Remove every registration owned by `owner`.
    pub fn unlisten_owner(&self, owner: u64) {
        let mut listeners = self.listeners.lock().expect("listener table poisoned");
        listeners.retain(|_, list| {
            list.retain(|r| r.owner != owner);
            !list.is_empty()
        });
    }

    /// Drop registrations for a destroyed entity.
    pub fn forget_entity(&self, entity: Entity) {
        self.listeners
            .lock()
            .expect("listener table poisoned")
            .retain(|(e, _), _| *e != entity);
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Event-hash keyed listener lists.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<u64, Vec<Registration<EventListenerFn>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, event: u64, owner: u64, f: EventListenerFn) {
        self.listeners
            .lock()
            .expect("event bus poisoned")
            .entry(event)
            .or_default()
            .push(Registration {
                owner,
                callback: f,
            });
    }

    /// Synchronously invoke all listeners of `event` on the calling
    /// thread.
    pub fn notify(&self, event: u64, entities: &[Entity], data: &[u8]) {
        let snapshot: Vec<EventListenerFn> = {
            let listeners = self.listeners.lock().expect("event bus poisoned");
            match listeners.get(&event) {
                Some(list) => list.iter().map(|r| Arc::clone(&r.callback)).collect(),
                None => return,
            }
        };
        for callback in snapshot {
            callback(entities, data);
        }
    }

    /// Remove every registration owned by `owner`.
    pub fn unlisten_owner(&self, owner: u64) {
        let mut listeners = self.listeners.lock().expect("event bus poisoned");
        listeners.retain(|_, list| {
            list.retain(|r| r.owner != owner);
            !list.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn listeners_fire_per_entity() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        let e1 = Entity::new(1, 0);
        let e2 = Entity::new(2, 0);
        let c = ComponentIndex(0);

        let hits_clone = Arc::clone(&hits);
        table.listen(e1, c, 1, Arc::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        table.notify(c, &[e1, e2]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        table.notify(c, &[e1]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unlisten_owner_removes_all_registrations() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicU32::new(0));
        let e = Entity::new(1, 0);

        for c in 0..3u16 {
            let hits_clone = Arc::clone(&hits);
            table.listen(e, ComponentIndex(c), 7, Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }));
        }
        table.unlisten_owner(7);
        for c in 0..3u16 {
            table.notify(ComponentIndex(c), &[e]);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_mutate_the_table_during_dispatch() {
        let table = Arc::new(ListenerTable::new());
        let e = Entity::new(1, 0);
        let c = ComponentIndex(0);

        let table_clone = Arc::clone(&table);
        table.listen(e, c, 1, Arc::new(move |_| {
            // Removing ourselves mid-dispatch must not deadlock.
            table_clone.unlisten_owner(1);
        }));
        table.notify(c, &[e]);
        table.notify(c, &[e]);
    }

    #[test]
    fn events_deliver_entities_and_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        let event = keel_truth::hash::hash_name("exploded");

        bus.listen(event, 1, Arc::new(move |entities, data| {
            assert_eq!(entities.len(), 2);
            assert_eq!(data, &[1, 2, 3]);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.notify(event, &[Entity::new(1, 0), Entity::new(2, 0)], &[1, 2, 3]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // Unknown events are silently dropped.
        bus.notify(keel_truth::hash::hash_name("other"), &[], &[]);
    }
}
