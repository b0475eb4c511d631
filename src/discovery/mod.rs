//! Remote service discovery.

pub mod docker;

use crate::error::Result;
use crate::model::Service;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use docker::DockerDiscovery;

/// Anything that can list the remote services, keyed by name.
#[async_trait]
pub trait ServiceSource: Send + Sync + 'static {
    async fn list_services(&self) -> Result<BTreeMap<String, Service>>;
}
