//! Geo lookup port.

use async_trait::async_trait;
use faultline_common::AppResult;

use crate::models::Location;

#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// Resolve an ip address. `Ok(None)` when the address is unknown.
    async fn resolve(&self, ip_address: &str) -> AppResult<Option<Location>>;
}
