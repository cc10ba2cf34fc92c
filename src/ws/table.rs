use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub channel: String,
    pub subtopic: String,
    pub publisher: String,
    pub connected_at: i64,
}

/// Live sessions keyed by subscriber id. Only session setup and teardown
/// write to it.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, info: SessionInfo) {
        self.sessions.write().insert(id, info);
    }

    pub fn remove(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions currently bound to `channel`.
    pub fn on_channel(&self, channel: &str) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.channel == channel)
            .count()
    }
}
