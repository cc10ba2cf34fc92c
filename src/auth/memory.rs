use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AuthClient, AuthError};

/// In-process registry of device keys and channel grants.
pub struct MemoryAuth {
    things: RwLock<HashMap<String, String>>,
    grants: RwLock<HashMap<String, HashSet<String>>>,
    available: AtomicBool,
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self {
            things: RwLock::new(HashMap::new()),
            grants: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thing `id` authenticated by `key`.
    pub fn with_thing(self, key: impl Into<String>, id: impl Into<String>) -> Self {
        self.things.write().insert(key.into(), id.into());
        self
    }

    /// Connect thing `id` to `channel`.
    pub fn with_grant(self, channel: impl Into<String>, id: impl Into<String>) -> Self {
        self.grant(channel, id);
        self
    }

    pub fn grant(&self, channel: impl Into<String>, id: impl Into<String>) {
        self.grants
            .write()
            .entry(channel.into())
            .or_default()
            .insert(id.into());
    }

    pub fn revoke(&self, channel: &str, id: &str) {
        if let Some(ids) = self.grants.write().get_mut(channel) {
            ids.remove(id);
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lookup(&self, key: &str) -> Result<String, AuthError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("auth registry offline".to_string()));
        }
        self.things
            .read()
            .get(key)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}

#[async_trait]
impl AuthClient for MemoryAuth {
    async fn can_access(&self, channel: &str, key: &str) -> Result<String, AuthError> {
        let id = self.lookup(key)?;
        let allowed = self
            .grants
            .read()
            .get(channel)
            .is_some_and(|ids| ids.contains(&id));
        if allowed { Ok(id) } else { Err(AuthError::Unauthorized) }
    }

    async fn identify(&self, key: &str) -> Result<String, AuthError> {
        self.lookup(key)
    }
}
