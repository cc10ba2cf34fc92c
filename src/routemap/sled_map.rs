use sled::{Db, Tree};
use tracing::warn;

use super::RouteMap;
use crate::utils::error::StoreError;

/// `RouteMap` stored in one sled tree per map prefix.
#[derive(Clone)]
pub struct SledRouteMap {
    tree: Tree,
    prefix: String,
}

impl SledRouteMap {
    pub fn new(db: &Db, prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(format!("routemap:{prefix}"))?,
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|_| StoreError::Corrupted(key.to_string())),
            None => Ok(None),
        }
    }
}

impl RouteMap for SledRouteMap {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        self.lookup(key)?.ok_or_else(|| {
            warn!(map = %self.prefix, %key, "route not found");
            StoreError::NotFound(key.to_string())
        })
    }

    fn save(&self, internal: &str, external: &str) -> Result<(), StoreError> {
        self.tree.insert(internal.as_bytes(), external.as_bytes())?;
        self.tree.insert(external.as_bytes(), internal.as_bytes())?;
        Ok(())
    }

    fn remove(&self, internal: &str) -> Result<(), StoreError> {
        let external = self.lookup(internal)?;
        self.tree.remove(internal.as_bytes())?;
        if let Some(external) = external {
            self.tree.remove(external.as_bytes())?;
        }
        Ok(())
    }
}
