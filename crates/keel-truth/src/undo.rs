//! Undo scopes and the action log.
//!
//! Every commit made with a non-zero scope appends a `(before, after)`
//! snapshot pair to that scope. Scopes are process-lifetime, may be undone
//! and redone out of order, and are only reclaimed at teardown.
//!
//! Interactive drags need no extra API: commit intermediate values with
//! scope 0, re-commit the initial value with scope 0 at release, then
//! commit the final value under a real scope. The recorded action then
//! captures `initial -> final` rather than the last intermediate step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::object::{ObjectId, ObjectSnapshot};

/// Token identifying an undo scope. `0` means "not recorded".
pub type UndoScopeId = u64;

/// The "not recorded" scope.
pub const NO_UNDO_SCOPE: UndoScopeId = 0;

/// High bit marking scopes whose appends may come from multiple threads.
pub const THREAD_SAFE_SCOPE_BIT: u64 = 1 << 63;

// ---------------------------------------------------------------------------
// UndoAction
// ---------------------------------------------------------------------------

/// One recorded state transition of a single object. `None` means the
/// object did not exist on that side of the transition.
#[derive(Clone)]
pub struct UndoAction {
    pub object: ObjectId,
    pub before: Option<Arc<ObjectSnapshot>>,
    pub after: Option<Arc<ObjectSnapshot>>,
}

impl std::fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoAction")
            .field("object", &self.object)
            .field("has_before", &self.before.is_some())
            .field("has_after", &self.after.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UndoLog
// ---------------------------------------------------------------------------

struct ScopeData {
    name: String,
    actions: Vec<UndoAction>,
}

/// All undo scopes of a store. Appends synchronize on an internal lock, so
/// the thread-safe flag on a scope is advisory: it documents the caller's
/// intent and is preserved in the token.
pub(crate) struct UndoLog {
    scopes: Mutex<HashMap<u64, ScopeData>>,
    next: AtomicU64,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a scope token. Tokens are monotone and never zero.
    pub fn create_scope(&self, name: &str, thread_safe: bool) -> UndoScopeId {
        let raw = self.next.fetch_add(1, Ordering::AcqRel);
        let id = if thread_safe {
            raw | THREAD_SAFE_SCOPE_BIT
        } else {
            raw
        };
        self.scopes.lock().expect("undo log poisoned").insert(
            id,
            ScopeData {
                name: name.to_owned(),
                actions: Vec::new(),
            },
        );
        id
    }

    /// Append an action to a scope. A zero scope is a no-op; an unknown
    /// scope is logged and dropped.
    pub fn record(&self, scope: UndoScopeId, action: UndoAction) {
        if scope == NO_UNDO_SCOPE {
            return;
        }
        let mut scopes = self.scopes.lock().expect("undo log poisoned");
        match scopes.get_mut(&scope) {
            Some(data) => data.actions.push(action),
            None => warn!(scope, "commit recorded against unknown undo scope"),
        }
    }

    /// The actions of a scope, in recording order.
    pub fn actions(&self, scope: UndoScopeId) -> Vec<UndoAction> {
        self.scopes
            .lock()
            .expect("undo log poisoned")
            .get(&scope)
            .map(|d| d.actions.clone())
            .unwrap_or_default()
    }

    /// The distinct objects touched by a scope, in first-touch order.
    pub fn objects(&self, scope: UndoScopeId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for action in self.actions(scope) {
            if !out.contains(&action.object) {
                out.push(action.object);
            }
        }
        out
    }

    /// The name a scope was created with.
    pub fn scope_name(&self, scope: UndoScopeId) -> Option<String> {
        self.scopes
            .lock()
            .expect("undo log poisoned")
            .get(&scope)
            .map(|d| d.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_monotone_and_nonzero() {
        let log = UndoLog::new();
        let a = log.create_scope("a", false);
        let b = log.create_scope("b", false);
        assert_ne!(a, NO_UNDO_SCOPE);
        assert!(b > a);
    }

    #[test]
    fn thread_safe_scopes_carry_the_marker_bit() {
        let log = UndoLog::new();
        let plain = log.create_scope("plain", false);
        let safe = log.create_scope("safe", true);
        assert_eq!(plain & THREAD_SAFE_SCOPE_BIT, 0);
        assert_ne!(safe & THREAD_SAFE_SCOPE_BIT, 0);
        assert_eq!(log.scope_name(safe).as_deref(), Some("safe"));
    }

    #[test]
    fn record_on_zero_scope_is_dropped() {
        let log = UndoLog::new();
        log.record(
            NO_UNDO_SCOPE,
            UndoAction {
                object: ObjectId::NONE,
                before: None,
                after: None,
            },
        );
        assert!(log.actions(NO_UNDO_SCOPE).is_empty());
    }
}
