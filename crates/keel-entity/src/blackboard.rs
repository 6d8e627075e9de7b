//! Per-context blackboard.
//!
//! A thread-safe map from name hash to a double or an opaque pointer,
//! used for cross-cutting per-tick values (delta time, wall time, editor
//! viewport, ...). Writers are the frame driver; engines read the numeric
//! entries through the snapshot passed in their update set, or directly
//! through this map.

use std::sync::LazyLock;

use dashmap::DashMap;

use keel_truth::hash::hash_name;

/// Well-known key: simulation delta time of the current tick, in seconds.
pub static BLACKBOARD_DELTA_TIME: LazyLock<u64> = LazyLock::new(|| hash_name("delta_time"));

/// Well-known key: accumulated simulation time, in seconds.
pub static BLACKBOARD_TIME: LazyLock<u64> = LazyLock::new(|| hash_name("time"));

/// Well-known key: wall-clock delta time of the current tick, in seconds.
pub static BLACKBOARD_WALL_DELTA_TIME: LazyLock<u64> =
    LazyLock::new(|| hash_name("wall_delta_time"));

/// A blackboard entry value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlackboardValue {
    Double(f64),
    /// An opaque pointer-sized value; the blackboard never dereferences it.
    Ptr(usize),
}

/// Thread-safe name-hash keyed value store.
#[derive(Debug, Default)]
pub struct Blackboard {
    entries: DashMap<u64, BlackboardValue>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a numeric entry.
    pub fn set_double(&self, key: u64, value: f64) {
        self.entries.insert(key, BlackboardValue::Double(value));
    }

    /// Read a numeric entry; `None` when absent or a pointer.
    pub fn double(&self, key: u64) -> Option<f64> {
        match self.entries.get(&key).map(|v| *v) {
            Some(BlackboardValue::Double(v)) => Some(v),
            _ => None,
        }
    }

    /// Set an opaque pointer-sized entry.
    pub fn set_ptr(&self, key: u64, value: usize) {
        self.entries.insert(key, BlackboardValue::Ptr(value));
    }

    /// Read an opaque pointer-sized entry.
    pub fn ptr(&self, key: u64) -> Option<usize> {
        match self.entries.get(&key).map(|v| *v) {
            Some(BlackboardValue::Ptr(v)) => Some(v),
            _ => None,
        }
    }

    /// Snapshot of all numeric entries, for the scheduler's update sets.
    pub fn doubles_snapshot(&self) -> Vec<(u64, f64)> {
        self.entries
            .iter()
            .filter_map(|entry| match *entry.value() {
                BlackboardValue::Double(v) => Some((*entry.key(), v)),
                BlackboardValue::Ptr(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_ptrs_roundtrip() {
        let bb = Blackboard::new();
        bb.set_double(*BLACKBOARD_DELTA_TIME, 1.0 / 60.0);
        bb.set_ptr(hash_name("viewport"), 0xdead_beef);

        assert_eq!(bb.double(*BLACKBOARD_DELTA_TIME), Some(1.0 / 60.0));
        assert_eq!(bb.ptr(hash_name("viewport")), Some(0xdead_beef));
        // Kind-mismatched reads answer None.
        assert_eq!(bb.ptr(*BLACKBOARD_DELTA_TIME), None);
        assert_eq!(bb.double(hash_name("viewport")), None);
    }

    #[test]
    fn snapshot_contains_only_doubles() {
        let bb = Blackboard::new();
        bb.set_double(*BLACKBOARD_TIME, 2.0);
        bb.set_ptr(hash_name("p"), 1);
        let snapshot = bb.doubles_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0], (*BLACKBOARD_TIME, 2.0));
    }

    #[test]
    fn concurrent_writers_do_not_tear() {
        use std::sync::Arc;
        let bb = Arc::new(Blackboard::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let bb = Arc::clone(&bb);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    bb.set_double(t, (t * 10_000 + i) as f64);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for t in 0..4u64 {
            let v = bb.double(t).unwrap();
            assert_eq!(v, (t * 10_000 + 999) as f64);
        }
    }
}
