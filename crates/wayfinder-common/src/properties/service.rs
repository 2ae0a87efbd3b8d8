use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::PropertyRecord;
use super::strategy::StrategyProperties;
use crate::error::{DiscoveryError, Result};

/// Name of the health-adaptive consistent hash strategy.
pub const ADAPTIVE_STRATEGY: &str = "adaptive";

/// How a request without an explicit hash key lands on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HashMethod {
    /// Every request gets a random ring position
    #[default]
    Random,
    /// Capture groups of the first matching pattern form the hash key, so
    /// requests for the same resource stick to the same endpoint
    UriRegex { regexes: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProperties {
    pub service_name: String,
    pub cluster_name: String,
    /// Path prefix prepended to the request path on the chosen endpoint
    pub path: String,
    /// Strategy names in priority order; the first supported one is used
    #[serde(default = "default_strategy_list")]
    pub strategy_list: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyProperties,
    /// Endpoint URI schemes in order of preference; empty accepts any
    #[serde(default)]
    pub prioritized_schemes: Vec<String>,
    #[serde(default)]
    pub banned_uris: BTreeSet<String>,
    #[serde(default)]
    pub hash_method: HashMethod,
}

fn default_strategy_list() -> Vec<String> {
    vec![ADAPTIVE_STRATEGY.to_string()]
}

impl ServiceProperties {
    pub fn new(
        service_name: impl Into<String>,
        cluster_name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            cluster_name: cluster_name.into(),
            path: path.into(),
            strategy_list: default_strategy_list(),
            strategy: StrategyProperties::default(),
            prioritized_schemes: Vec::new(),
            banned_uris: BTreeSet::new(),
            hash_method: HashMethod::Random,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyProperties) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_schemes(mut self, schemes: &[&str]) -> Self {
        self.prioritized_schemes = schemes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_banned(&self, uri: &str) -> bool {
        self.banned_uris.contains(uri)
    }
}

impl PropertyRecord for ServiceProperties {
    fn key(&self) -> &str {
        &self.service_name
    }

    fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(DiscoveryError::config_inconsistent("<service>", "service name is empty"));
        }
        if self.cluster_name.is_empty() {
            return Err(DiscoveryError::config_inconsistent(
                &self.service_name,
                "cluster name is empty",
            ));
        }
        if !self.strategy_list.iter().any(|s| s == ADAPTIVE_STRATEGY) {
            return Err(DiscoveryError::config_inconsistent(
                &self.service_name,
                format!("no supported strategy in {:?}", self.strategy_list),
            ));
        }
        if let HashMethod::UriRegex { regexes } = &self.hash_method {
            if regexes.is_empty() {
                return Err(DiscoveryError::config_inconsistent(
                    &self.service_name,
                    "uri_regex hash method needs at least one pattern",
                ));
            }
        }
        self.strategy.validate(&self.service_name)
    }
}
