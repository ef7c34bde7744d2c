use std::sync::Arc;

use dashmap::DashMap;

use super::{BroadcastId, BroadcastSession, SessionSnapshot};

/// Thread-safe registry of live broadcast sessions.
///
/// The single source of truth for "is this broadcast live". Every mutation is
/// a single `DashMap` operation, so two concurrent `remove` calls for the same
/// id yield exactly one `Some`. High-level teardown lives in
/// [`CleanupCoordinator`](crate::services::CleanupCoordinator).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<BroadcastId, Arc<BroadcastSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the session for `id`, returning the replaced one.
    pub fn upsert(
        &self,
        id: BroadcastId,
        session: Arc<BroadcastSession>,
    ) -> Option<Arc<BroadcastSession>> {
        self.sessions.insert(id, session)
    }

    /// Retrieves a live session.
    pub fn get(&self, id: &BroadcastId) -> Option<Arc<BroadcastSession>> {
        self.sessions.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Atomically removes and returns a session.
    pub fn remove(&self, id: &BroadcastId) -> Option<Arc<BroadcastSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Removes only if the entry is still the given instance.
    ///
    /// Used by teardown so a replacement session registered under the same
    /// id is never removed by the old session's cleanup.
    pub fn remove_instance(&self, session: &Arc<BroadcastSession>) -> Option<Arc<BroadcastSession>> {
        self.sessions
            .remove_if(session.broadcast_id(), |_, current| {
                Arc::ptr_eq(current, session)
            })
            .map(|(_, session)| session)
    }

    /// Removes every session matching `predicate` and returns them.
    pub fn remove_where<F>(&self, predicate: F) -> Vec<Arc<BroadcastSession>>
    where
        F: Fn(&BroadcastSession) -> bool,
    {
        let mut removed = Vec::new();
        self.sessions.retain(|_, session| {
            if predicate(session) {
                removed.push(Arc::clone(session));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Every session matching `predicate`, as the instances currently registered.
    #[must_use]
    pub fn sessions_where<F>(&self, predicate: F) -> Vec<Arc<BroadcastSession>>
    where
        F: Fn(&BroadcastSession) -> bool,
    {
        self.sessions
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Whether `session` is still the registered instance for its id.
    #[must_use]
    pub fn is_current(&self, session: &Arc<BroadcastSession>) -> bool {
        self.sessions
            .get(session.broadcast_id())
            .is_some_and(|r| Arc::ptr_eq(r.value(), session))
    }

    /// Ids of every session matching `predicate`.
    #[must_use]
    pub fn ids_where<F>(&self, predicate: F) -> Vec<BroadcastId>
    where
        F: Fn(&BroadcastSession) -> bool,
    {
        self.sessions
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.key().clone())
            .collect()
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the ids of all live sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<BroadcastId> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Snapshots every live session.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|r| r.value().snapshot()).collect()
    }

}
