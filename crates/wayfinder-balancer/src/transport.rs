use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use wayfinder_common::Result;

/// Handle to an RPC client bound to one endpoint.
pub trait TransportClient: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &str;

    /// Releases connections; called once the endpoint leaves every cluster.
    fn shutdown(&self) {}
}

/// Builds transport clients for endpoints of one URI scheme.
pub trait TransportClientFactory: Send + Sync {
    fn client(&self, endpoint: &str) -> Result<Arc<dyn TransportClient>>;
}

/// Transport client factories keyed by URI scheme.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn TransportClientFactory>>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheme: impl Into<String>, factory: Arc<dyn TransportClientFactory>) {
        let scheme = scheme.into();
        debug!("Registered transport for scheme {}", scheme);
        self.factories.write().insert(scheme, factory);
    }

    pub fn with(self, scheme: impl Into<String>, factory: Arc<dyn TransportClientFactory>) -> Self {
        self.register(scheme, factory);
        self
    }

    /// Factory for the scheme of `endpoint`, if one is registered.
    pub fn factory_for(&self, endpoint: &str) -> Option<Arc<dyn TransportClientFactory>> {
        let scheme = scheme_of(endpoint)?;
        self.factories.read().get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

pub(crate) fn scheme_of(endpoint: &str) -> Option<&str> {
    endpoint.split_once("://").map(|(scheme, _)| scheme)
}

/// Transport that only remembers its endpoint, for wiring and tests.
#[derive(Debug)]
pub struct StaticClient {
    endpoint: String,
}

impl TransportClient for StaticClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Factory producing [`StaticClient`]s.
#[derive(Debug, Default)]
pub struct StaticClientFactory;

impl TransportClientFactory for StaticClientFactory {
    fn client(&self, endpoint: &str) -> Result<Arc<dyn TransportClient>> {
        Ok(Arc::new(StaticClient {
            endpoint: endpoint.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_lookup_by_scheme() {
        let registry = TransportRegistry::new().with("http", Arc::new(StaticClientFactory));
        assert!(registry.factory_for("http://a:1/").is_some());
        assert!(registry.factory_for("https://a:1/").is_none());
        assert!(registry.factory_for("no-scheme").is_none());
        assert_eq!(registry.schemes(), vec!["http".to_string()]);

        let client = registry.factory_for("http://a:1/").unwrap().client("http://a:1/").unwrap();
        assert_eq!(client.endpoint(), "http://a:1/");
    }
}
