//! Outbound port for the discovery backend.
//!
//! The mapper never captures packets itself. It hands a validated interface
//! and network to a [`NetworkScanner`] and receives the raw sightings back.

use async_trait::async_trait;

use crate::network::range::ScanNetwork;
use crate::network::target::Target;

#[async_trait]
pub trait NetworkScanner: Send + Sync {
    /// Performs one discovery sweep of `network` through `interface`.
    async fn scan(&self, interface: &str, network: &ScanNetwork) -> anyhow::Result<Vec<Target>>;
}
