//! Property records published through the coordination service.

pub mod cluster;
pub mod service;
pub mod strategy;
pub mod uri;

use crate::error::Result;

pub use cluster::{ClusterProperties, HashAlgorithm, PartitionKeyRule, PartitionProperties};
pub use service::{ADAPTIVE_STRATEGY, HashMethod, ServiceProperties};
pub use strategy::{LatencyToUse, StrategyProperties};
pub use uri::{EndpointProperties, UriProperties};

/// A keyed property record.
pub trait PropertyRecord {
    /// Store key the record lives under.
    fn key(&self) -> &str;

    /// Rejects records that would leave the balancer in an inconsistent state.
    fn validate(&self) -> Result<()>;
}

/// The three kinds of property record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyKind {
    Cluster,
    Service,
    Uris,
}

impl PropertyKind {
    /// Directory name of this kind under the coordination base path and the
    /// backup directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PropertyKind::Cluster => "clusters",
            PropertyKind::Service => "services",
            PropertyKind::Uris => "uris",
        }
    }
}

impl std::fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}
