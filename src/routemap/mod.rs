//! Route maps translate identifiers between a gateway protocol and the
//! platform (`external id <-> internal id`).

mod sled_map;

use crate::utils::error::StoreError;

pub use sled_map::SledRouteMap;

pub trait RouteMap: Send + Sync {
    /// Value routed from `key`. An unknown key is `StoreError::NotFound`.
    fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Route `internal` and `external` to each other.
    fn save(&self, internal: &str, external: &str) -> Result<(), StoreError>;

    /// Drop the route for `internal` in both directions.
    fn remove(&self, internal: &str) -> Result<(), StoreError>;
}
