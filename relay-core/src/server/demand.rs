//! Which devices connected clients are actively polling.

use std::collections::{BTreeMap, BTreeSet};

/// Identifies one client session on the server.
pub type SessionId = u64;

/// Session id used for calls made in-process rather than over a session.
pub const LOCAL_SESSION: SessionId = 0;

/// Device guids in demand, with the sessions that asked for each.
///
/// A guid stays in demand while at least one session that polled it is
/// still connected.
#[derive(Debug, Default, Clone)]
pub struct UpdateDemandSet {
    demand: BTreeMap<String, BTreeSet<SessionId>>,
}

impl UpdateDemandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session` polled `guid`.
    pub fn mark(&mut self, guid: &str, session: SessionId) {
        self.demand.entry(guid.to_string()).or_default().insert(session);
    }

    /// Forget everything `session` asked for. Returns the guids that are
    /// no longer in demand at all.
    pub fn release_session(&mut self, session: SessionId) -> Vec<String> {
        let mut released = Vec::new();
        self.demand.retain(|guid, sessions| {
            sessions.remove(&session);
            if sessions.is_empty() {
                released.push(guid.clone());
                false
            } else {
                true
            }
        });
        released
    }

    /// Guids in demand, sorted.
    pub fn guids(&self) -> Vec<String> {
        self.demand.keys().cloned().collect()
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.demand.contains_key(guid)
    }

    pub fn len(&self) -> usize {
        self.demand.len()
    }

    pub fn is_empty(&self) -> bool {
        self.demand.is_empty()
    }
}
