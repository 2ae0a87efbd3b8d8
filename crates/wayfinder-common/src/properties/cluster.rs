use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::PropertyRecord;
use crate::error::{DiscoveryError, Result};

/// How a request key is pulled out of a request URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum PartitionKeyRule {
    /// Value of the named query parameter
    QueryParam { name: String },
    /// First capture group of the pattern, matched against path and query
    Regex { pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Numeric key modulo the partition count
    #[default]
    Modulo,
    /// SHA-256 of the key bytes modulo the partition count
    Sha256,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionProperties {
    /// Single partition 0
    #[default]
    None,
    Hash {
        partition_count: u32,
        #[serde(default)]
        algorithm: HashAlgorithm,
        key: PartitionKeyRule,
    },
    /// Partition `i` covers keys in `[boundaries[i], boundaries[i + 1])`.
    Range {
        boundaries: Vec<i64>,
        key: PartitionKeyRule,
    },
}

impl PartitionProperties {
    /// Evenly sized range partitions starting at `start`.
    pub fn uniform_range(start: i64, size: i64, count: u32, key: PartitionKeyRule) -> Self {
        let boundaries = (0..=count as i64).map(|i| start + i * size).collect();
        PartitionProperties::Range { boundaries, key }
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            PartitionProperties::None => 1,
            PartitionProperties::Hash { partition_count, .. } => *partition_count,
            PartitionProperties::Range { boundaries, .. } => boundaries.len().saturating_sub(1) as u32,
        }
    }

    /// Checks counts, boundaries and key rules; `key` names the cluster in errors.
    pub fn validate(&self, key: &str) -> Result<()> {
        let check_rule = |rule: &PartitionKeyRule| match rule {
            PartitionKeyRule::QueryParam { name } if name.is_empty() => Err(
                DiscoveryError::config_inconsistent(key, "partition key parameter name is empty"),
            ),
            PartitionKeyRule::Regex { pattern } if pattern.is_empty() => Err(
                DiscoveryError::config_inconsistent(key, "partition key pattern is empty"),
            ),
            _ => Ok(()),
        };

        match self {
            PartitionProperties::None => Ok(()),
            PartitionProperties::Hash {
                partition_count,
                key: rule,
                ..
            } => {
                if *partition_count == 0 {
                    return Err(DiscoveryError::config_inconsistent(
                        key,
                        "hash partition count must be positive",
                    ));
                }
                check_rule(rule)
            }
            PartitionProperties::Range {
                boundaries,
                key: rule,
            } => {
                if boundaries.len() < 2 {
                    return Err(DiscoveryError::config_inconsistent(
                        key,
                        "range partitioning needs at least two boundaries",
                    ));
                }
                if boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(DiscoveryError::config_inconsistent(
                        key,
                        "range boundaries must be strictly ascending",
                    ));
                }
                check_rule(rule)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProperties {
    pub cluster_name: String,
    #[serde(default)]
    pub partition: PartitionProperties,
    /// Endpoints never selected for any service of this cluster
    #[serde(default)]
    pub banned_uris: BTreeSet<String>,
}

impl ClusterProperties {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            partition: PartitionProperties::None,
            banned_uris: BTreeSet::new(),
        }
    }

    pub fn with_partition(mut self, partition: PartitionProperties) -> Self {
        self.partition = partition;
        self
    }

    pub fn is_banned(&self, uri: &str) -> bool {
        self.banned_uris.contains(uri)
    }
}

impl PropertyRecord for ClusterProperties {
    fn key(&self) -> &str {
        &self.cluster_name
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(DiscoveryError::config_inconsistent("<cluster>", "cluster name is empty"));
        }
        self.partition.validate(&self.cluster_name)
    }
}
