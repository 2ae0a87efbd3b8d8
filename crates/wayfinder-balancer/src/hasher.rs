use http::Uri;
use regex::Regex;
use wayfinder_common::properties::HashMethod;
use wayfinder_common::{DiscoveryError, Result};

use crate::ring::Ring;

/// Turns a request into a ring hash.
///
/// With `UriRegex` the capture groups of the first matching regex are
/// concatenated and hashed, so requests for the same entity stick to the
/// same endpoint. Anything unmatched hashes randomly.
#[derive(Debug, Clone)]
pub enum RequestHasher {
    Random,
    UriRegex(Vec<Regex>),
}

impl RequestHasher {
    pub fn new(service: &str, method: &HashMethod) -> Result<Self> {
        match method {
            HashMethod::Random => Ok(RequestHasher::Random),
            HashMethod::UriRegex { regexes } => regexes
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|e| DiscoveryError::config_inconsistent(service, e.to_string()))
                })
                .collect::<Result<Vec<_>>>()
                .map(RequestHasher::UriRegex),
        }
    }

    /// Sticky key of `uri`, if any regex matches it.
    pub fn key_of(&self, uri: &Uri) -> Option<String> {
        let RequestHasher::UriRegex(regexes) = self else {
            return None;
        };
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
        regexes.iter().find_map(|regex| {
            let caps = regex.captures(target)?;
            let key: String = caps.iter().skip(1).flatten().map(|m| m.as_str()).collect();
            Some(key)
        })
    }

    pub fn hash(&self, uri: &Uri) -> u32 {
        match self.key_of(uri) {
            Some(key) => Ring::hash_key(key.as_bytes()),
            None => rand::random::<u32>(),
        }
    }
}
