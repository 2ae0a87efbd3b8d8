use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PropertyRecord;
use crate::error::{DiscoveryError, Result};

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProperties {
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Partition id -> weight within that partition
    #[serde(default)]
    pub partitions: BTreeMap<u32, f64>,
}

impl Default for EndpointProperties {
    fn default() -> Self {
        Self {
            weight: default_weight(),
            partitions: BTreeMap::new(),
        }
    }
}

impl EndpointProperties {
    pub fn with_weight(weight: f64) -> Self {
        Self {
            weight,
            partitions: BTreeMap::new(),
        }
    }

    /// Weight of this endpoint in `partition`, if it belongs to it.
    pub fn weight_in(&self, partition: u32) -> Option<f64> {
        if self.partitions.is_empty() {
            (partition == 0).then_some(self.weight)
        } else {
            self.partitions.get(&partition).copied()
        }
    }
}

/// Endpoint set of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriProperties {
    pub cluster_name: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointProperties>,
}

impl UriProperties {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, uri: impl Into<String>, endpoint: EndpointProperties) -> Self {
        self.endpoints.insert(uri.into(), endpoint);
        self
    }

    /// Folds a later announcement into this one.
    ///
    /// URIs are unioned. For a URI present in both, `later`'s weight wins and
    /// the partition maps merge key by key with `later` taking precedence.
    pub fn merge(&mut self, later: UriProperties) {
        for (uri, incoming) in later.endpoints {
            match self.endpoints.get_mut(&uri) {
                Some(existing) => {
                    existing.weight = incoming.weight;
                    existing.partitions.extend(incoming.partitions);
                }
                None => {
                    self.endpoints.insert(uri, incoming);
                }
            }
        }
    }

    /// Merges announcements in order, earliest first.
    pub fn merged(cluster_name: &str, parts: impl IntoIterator<Item = UriProperties>) -> Self {
        let mut merged = UriProperties::new(cluster_name);
        for part in parts {
            merged.merge(part);
        }
        merged
    }

    /// Endpoints of `partition` with their weight there.
    pub fn endpoints_in_partition(&self, partition: u32) -> BTreeMap<&str, f64> {
        self.endpoints
            .iter()
            .filter_map(|(uri, ep)| ep.weight_in(partition).map(|w| (uri.as_str(), w)))
            .collect()
    }
}

impl PropertyRecord for UriProperties {
    fn key(&self) -> &str {
        &self.cluster_name
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(DiscoveryError::config_inconsistent("<uris>", "cluster name is empty"));
        }
        for (uri, ep) in &self.endpoints {
            if !uri.contains("://") {
                return Err(DiscoveryError::config_inconsistent(
                    &self.cluster_name,
                    format!("endpoint '{}' is not an absolute URI", uri),
                ));
            }
            let weights = std::iter::once(ep.weight).chain(ep.partitions.values().copied());
            for w in weights {
                if !w.is_finite() || w < 0.0 {
                    return Err(DiscoveryError::config_inconsistent(
                        &self.cluster_name,
                        format!("endpoint '{}' has invalid weight {}", uri, w),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_without_partitions_is_in_partition_zero() {
        let ep = EndpointProperties::with_weight(2.0);
        assert_eq!(ep.weight_in(0), Some(2.0));
        assert_eq!(ep.weight_in(1), None);
    }

    #[test]
    fn test_partition_map_overrides_default() {
        let mut ep = EndpointProperties::with_weight(1.0);
        ep.partitions.insert(3, 0.5);
        assert_eq!(ep.weight_in(0), None);
        assert_eq!(ep.weight_in(3), Some(0.5));
    }

    #[test]
    fn test_merge_unions_and_later_wins() {
        let mut first = UriProperties::new("c")
            .with_endpoint("http://a:1/", EndpointProperties::with_weight(1.0))
            .with_endpoint("http://b:1/", EndpointProperties::with_weight(1.0));
        first
            .endpoints
            .get_mut("http://b:1/")
            .unwrap()
            .partitions
            .extend([(0, 1.0), (1, 1.0)]);

        let mut b_later = EndpointProperties::with_weight(3.0);
        b_later.partitions.insert(1, 4.0);
        let later = UriProperties::new("c")
            .with_endpoint("http://b:1/", b_later)
            .with_endpoint("http://c:1/", EndpointProperties::default());

        first.merge(later);

        assert_eq!(first.endpoints.len(), 3);
        let b = &first.endpoints["http://b:1/"];
        assert_eq!(b.weight, 3.0);
        assert_eq!(b.partitions.get(&0), Some(&1.0));
        assert_eq!(b.partitions.get(&1), Some(&4.0));
        assert_eq!(first.endpoints["http://a:1/"].weight, 1.0);
    }

    #[test]
    fn test_endpoints_in_partition() {
        let mut partitioned = EndpointProperties::default();
        partitioned.partitions.insert(1, 2.0);
        let uris = UriProperties::new("c")
            .with_endpoint("http://a:1/", EndpointProperties::default())
            .with_endpoint("http://b:1/", partitioned);

        let p0 = uris.endpoints_in_partition(0);
        let p1 = uris.endpoints_in_partition(1);
        assert_eq!(p0.len(), 1);
        assert!(p0.contains_key("http://a:1/"));
        assert_eq!(p1.get("http://b:1/"), Some(&2.0));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let uris = UriProperties::new("c")
            .with_endpoint("http://a:1/", EndpointProperties::with_weight(-1.0));
        assert!(uris.validate().is_err());
    }

    #[test]
    fn test_relative_uri_rejected() {
        let uris = UriProperties::new("c").with_endpoint("a:1", EndpointProperties::default());
        assert!(uris.validate().is_err());
    }
}
