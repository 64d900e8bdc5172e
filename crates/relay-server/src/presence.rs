//! Presence registry: which sessions are live for each identity.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::Mutex;
use relay_core::Identity;
use relay_core::ids::SessionId;
use tracing::debug;

use crate::metrics::PRESENCE_IDENTITIES;
use crate::websocket::connection::SessionHandle;

/// Maps each authenticated identity to its live sessions, in login order.
///
/// Every operation runs under one lock and touches only the map; callers
/// take a snapshot with [`sessions_for`](Self::sessions_for) and write to
/// sockets after the lock is released.
pub struct PresenceRegistry {
    inner: Mutex<HashMap<Identity, Vec<Arc<SessionHandle>>>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append `session` to `identity`'s sessions.
    pub fn register(&self, identity: Identity, session: Arc<SessionHandle>) {
        let mut inner = self.inner.lock();
        debug!(%identity, session_id = %session.id, "session registered");
        inner.entry(identity).or_default().push(session);
        publish_identity_count(inner.len());
    }

    /// Remove the first session of `identity` whose id matches.
    ///
    /// Drops the identity once it has no sessions left. Returns whether a
    /// session was removed; absent entries are a no-op.
    pub fn deregister(&self, identity: &Identity, session_id: &SessionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(sessions) = inner.get_mut(identity) else {
            return false;
        };
        let Some(pos) = sessions.iter().position(|s| &s.id == session_id) else {
            return false;
        };
        let _ = sessions.remove(pos);
        if sessions.is_empty() {
            let _ = inner.remove(identity);
        }
        publish_identity_count(inner.len());
        debug!(%identity, %session_id, "session deregistered");
        true
    }

    /// Snapshot of `identity`'s live sessions.
    ///
    /// Sessions may close after the snapshot is taken; pushing to a closed
    /// session fails harmlessly.
    pub fn sessions_for(&self, identity: &Identity) -> Vec<Arc<SessionHandle>> {
        self.inner.lock().get(identity).cloned().unwrap_or_default()
    }

    /// Number of identities with at least one session.
    pub fn identity_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total registered sessions across all identities.
    pub fn session_count(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

#[allow(clippy::cast_precision_loss)]
fn publish_identity_count(count: usize) {
    gauge!(PRESENCE_IDENTITIES).set(count as f64);
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<SessionHandle> {
        let (handle, _rx) = SessionHandle::new(None, 4);
        Arc::new(handle)
    }

    #[test]
    fn empty_registry() {
        let registry = PresenceRegistry::new();
        assert_eq!(registry.identity_count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.sessions_for(&"alice".into()).is_empty());
    }

    #[test]
    fn register_appends_in_order() {
        let registry = PresenceRegistry::new();
        let first = session();
        let second = session();
        registry.register("alice".into(), first.clone());
        registry.register("alice".into(), second.clone());

        let sessions = registry.sessions_for(&"alice".into());
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, first.id);
        assert_eq!(sessions[1].id, second.id);
        assert_eq!(registry.identity_count(), 1);
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn deregister_removes_only_the_matching_session() {
        let registry = PresenceRegistry::new();
        let first = session();
        let second = session();
        registry.register("alice".into(), first.clone());
        registry.register("alice".into(), second.clone());

        assert!(registry.deregister(&"alice".into(), &first.id));
        let sessions = registry.sessions_for(&"alice".into());
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, second.id);
    }

    #[test]
    fn last_deregister_drops_identity() {
        let registry = PresenceRegistry::new();
        let only = session();
        registry.register("alice".into(), only.clone());
        assert!(registry.deregister(&"alice".into(), &only.id));
        assert_eq!(registry.identity_count(), 0);
    }

    #[test]
    fn double_deregister_is_noop_and_spares_others() {
        let registry = PresenceRegistry::new();
        let alice = session();
        let bob = session();
        registry.register("alice".into(), alice.clone());
        registry.register("bob".into(), bob.clone());

        assert!(registry.deregister(&"alice".into(), &alice.id));
        assert!(!registry.deregister(&"alice".into(), &alice.id));
        assert_eq!(registry.sessions_for(&"bob".into()).len(), 1);
        assert_eq!(registry.identity_count(), 1);
    }

    #[test]
    fn deregister_unknown_session_is_noop() {
        let registry = PresenceRegistry::new();
        let alice = session();
        registry.register("alice".into(), alice);
        assert!(!registry.deregister(&"alice".into(), &SessionId::new()));
        assert!(!registry.deregister(&"carol".into(), &SessionId::new()));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = PresenceRegistry::new();
        let alice = session();
        registry.register("alice".into(), alice.clone());
        let snapshot = registry.sessions_for(&"alice".into());
        let _ = registry.deregister(&"alice".into(), &alice.id);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.sessions_for(&"alice".into()).is_empty());
    }

    #[test]
    fn concurrent_register_and_deregister() {
        let registry = Arc::new(PresenceRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let identity = Identity::new(format!("user{}", i % 2));
                    for _ in 0..50 {
                        let s = session();
                        registry.register(identity.clone(), s.clone());
                        assert!(registry.deregister(&identity, &s.id));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.identity_count(), 0);
    }
}
