use http::Uri;
use regex::Regex;
use sha2::{Digest, Sha256};
use wayfinder_common::properties::{HashAlgorithm, PartitionKeyRule, PartitionProperties};
use wayfinder_common::{DiscoveryError, Result};

/// Pulls the partition key out of a request URI.
#[derive(Debug, Clone)]
enum KeyExtractor {
    QueryParam(String),
    Regex(Regex),
}

impl KeyExtractor {
    fn new(rule: &PartitionKeyRule, cluster: &str) -> Result<Self> {
        match rule {
            PartitionKeyRule::QueryParam { name } => Ok(KeyExtractor::QueryParam(name.clone())),
            PartitionKeyRule::Regex { pattern } => Regex::new(pattern)
                .map(KeyExtractor::Regex)
                .map_err(|e| DiscoveryError::config_inconsistent(cluster, e.to_string())),
        }
    }

    fn extract(&self, uri: &Uri) -> Result<String> {
        match self {
            KeyExtractor::QueryParam(name) => uri
                .query()
                .into_iter()
                .flat_map(|q| q.split('&'))
                .find_map(|pair| match pair.split_once('=') {
                    Some((k, v)) if k == name => Some(v.to_string()),
                    _ => None,
                })
                .ok_or_else(|| {
                    DiscoveryError::PartitionAccess(format!("missing query parameter '{}' in {}", name, uri))
                }),
            KeyExtractor::Regex(regex) => {
                let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
                regex
                    .captures(target)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
                    .ok_or_else(|| {
                        DiscoveryError::PartitionAccess(format!(
                            "no partition key matching '{}' in {}",
                            regex.as_str(),
                            uri
                        ))
                    })
            }
        }
    }
}

/// Maps requests of one cluster to partition ids.
///
/// A key that is missing, unparseable or outside every range is an error,
/// never a silent fallback to some default partition.
#[derive(Debug, Clone)]
pub enum PartitionAccessor {
    Single,
    Hash {
        count: u32,
        algorithm: HashAlgorithm,
        extractor: KeyExtractorHandle,
    },
    Range {
        boundaries: Vec<i64>,
        extractor: KeyExtractorHandle,
    },
}

/// Opaque key extraction rule of a [`PartitionAccessor`].
#[derive(Debug, Clone)]
pub struct KeyExtractorHandle(KeyExtractor);

impl PartitionAccessor {
    pub fn new(cluster: &str, properties: &PartitionProperties) -> Result<Self> {
        properties.validate(cluster)?;
        match properties {
            PartitionProperties::None => Ok(PartitionAccessor::Single),
            PartitionProperties::Hash {
                partition_count,
                algorithm,
                key,
            } => Ok(PartitionAccessor::Hash {
                count: *partition_count,
                algorithm: *algorithm,
                extractor: KeyExtractorHandle(KeyExtractor::new(key, cluster)?),
            }),
            PartitionProperties::Range { boundaries, key } => Ok(PartitionAccessor::Range {
                boundaries: boundaries.clone(),
                extractor: KeyExtractorHandle(KeyExtractor::new(key, cluster)?),
            }),
        }
    }

    pub fn max_partition_id(&self) -> u32 {
        match self {
            PartitionAccessor::Single => 0,
            PartitionAccessor::Hash { count, .. } => count.saturating_sub(1),
            PartitionAccessor::Range { boundaries, .. } => boundaries.len().saturating_sub(2) as u32,
        }
    }

    /// Partition of a request.
    pub fn partition_id(&self, uri: &Uri) -> Result<u32> {
        match self {
            PartitionAccessor::Single => Ok(0),
            PartitionAccessor::Hash { extractor, .. } | PartitionAccessor::Range { extractor, .. } => {
                let key = extractor.0.extract(uri)?;
                self.partition_id_for_key(&key)
            }
        }
    }

    /// Partition of an already extracted key.
    pub fn partition_id_for_key(&self, key: &str) -> Result<u32> {
        match self {
            PartitionAccessor::Single => Ok(0),
            PartitionAccessor::Hash {
                count,
                algorithm: HashAlgorithm::Modulo,
                ..
            } => {
                let value = parse_key(key)?;
                Ok(value.rem_euclid(*count as i64) as u32)
            }
            PartitionAccessor::Hash {
                count,
                algorithm: HashAlgorithm::Sha256,
                ..
            } => {
                let digest = Sha256::digest(key.as_bytes());
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                Ok((u64::from_be_bytes(head) % *count as u64) as u32)
            }
            PartitionAccessor::Range { boundaries, .. } => {
                let value = parse_key(key)?;
                let (first, last) = match (boundaries.first(), boundaries.last()) {
                    (Some(first), Some(last)) => (*first, *last),
                    _ => return Err(DiscoveryError::PartitionAccess("empty range table".to_string())),
                };
                if value < first || value >= last {
                    return Err(DiscoveryError::PartitionAccess(format!(
                        "key {} outside [{}, {})",
                        value, first, last
                    )));
                }
                Ok((boundaries.partition_point(|b| *b <= value) - 1) as u32)
            }
        }
    }
}

fn parse_key(key: &str) -> Result<i64> {
    key.trim()
        .parse::<i64>()
        .map_err(|_| DiscoveryError::PartitionAccess(format!("partition key '{}' is not an integer", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_rule() -> PartitionKeyRule {
        PartitionKeyRule::QueryParam {
            name: "memberId".to_string(),
        }
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_partition() {
        let accessor = PartitionAccessor::new("c", &PartitionProperties::None).unwrap();
        assert_eq!(accessor.partition_id(&uri("svc://profiles/a")).unwrap(), 0);
        assert_eq!(accessor.max_partition_id(), 0);
    }

    #[test]
    fn test_hash_modulo() {
        let props = PartitionProperties::Hash {
            partition_count: 4,
            algorithm: HashAlgorithm::Modulo,
            key: query_rule(),
        };
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        assert_eq!(accessor.partition_id(&uri("svc://p/x?memberId=10")).unwrap(), 2);
        assert_eq!(accessor.partition_id(&uri("svc://p/x?a=1&memberId=-1")).unwrap(), 3);
        assert_eq!(accessor.max_partition_id(), 3);
    }

    #[test]
    fn test_hash_sha256_is_stable() {
        let props = PartitionProperties::Hash {
            partition_count: 8,
            algorithm: HashAlgorithm::Sha256,
            key: query_rule(),
        };
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        let a = accessor.partition_id_for_key("alice").unwrap();
        assert_eq!(accessor.partition_id_for_key("alice").unwrap(), a);
        assert!(a < 8);
    }

    #[test]
    fn test_hash_missing_key_fails() {
        let props = PartitionProperties::Hash {
            partition_count: 4,
            algorithm: HashAlgorithm::Modulo,
            key: query_rule(),
        };
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        assert!(matches!(
            accessor.partition_id(&uri("svc://p/x?other=1")),
            Err(DiscoveryError::PartitionAccess(_))
        ));
        assert!(matches!(
            accessor.partition_id(&uri("svc://p/x?memberId=abc")),
            Err(DiscoveryError::PartitionAccess(_))
        ));
    }

    #[test]
    fn test_range_lookup() {
        let props = PartitionProperties::uniform_range(0, 100, 3, query_rule());
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        assert_eq!(accessor.partition_id_for_key("0").unwrap(), 0);
        assert_eq!(accessor.partition_id_for_key("99").unwrap(), 0);
        assert_eq!(accessor.partition_id_for_key("100").unwrap(), 1);
        assert_eq!(accessor.partition_id_for_key("299").unwrap(), 2);
        assert_eq!(accessor.max_partition_id(), 2);
    }

    #[test]
    fn test_range_out_of_bounds_fails() {
        let props = PartitionProperties::uniform_range(0, 100, 3, query_rule());
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        assert!(accessor.partition_id_for_key("300").is_err());
        assert!(accessor.partition_id_for_key("-1").is_err());
    }

    #[test]
    fn test_regex_key() {
        let props = PartitionProperties::Range {
            boundaries: vec![0, 1000, 2000],
            key: PartitionKeyRule::Regex {
                pattern: r"/members/(\d+)".to_string(),
            },
        };
        let accessor = PartitionAccessor::new("c", &props).unwrap();
        assert_eq!(accessor.partition_id(&uri("svc://p/members/1500/profile")).unwrap(), 1);
        assert!(accessor.partition_id(&uri("svc://p/groups/1500")).is_err());
    }

    #[test]
    fn test_unvalidated_layouts_are_rejected() {
        let empty_hash = PartitionProperties::Hash {
            partition_count: 0,
            algorithm: HashAlgorithm::Modulo,
            key: PartitionKeyRule::QueryParam {
                name: "id".to_string(),
            },
        };
        let short_range = PartitionProperties::Range {
            boundaries: vec![0],
            key: PartitionKeyRule::QueryParam {
                name: "id".to_string(),
            },
        };
        for props in [empty_hash, short_range] {
            assert!(matches!(
                PartitionAccessor::new("c", &props),
                Err(DiscoveryError::ConfigInconsistent { .. })
            ));
        }
    }

    #[test]
    fn test_bad_regex_is_config_error() {
        let props = PartitionProperties::Hash {
            partition_count: 2,
            algorithm: HashAlgorithm::Modulo,
            key: PartitionKeyRule::Regex {
                pattern: "(".to_string(),
            },
        };
        assert!(matches!(
            PartitionAccessor::new("c", &props),
            Err(DiscoveryError::ConfigInconsistent { .. })
        ));
    }
}
