//! Shared helpers for the resolver integration tests.
//!
//! Properties are written straight into an [`InMemoryEnsemble`] at the node
//! paths a `/d2` layout uses, or into the file backup a resolver falls back to.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wayfinder_balancer::{CoordinationFactory, Resolver, SessionConfig, StaticClientFactory, TransportRegistry};
use wayfinder_common::{
    ClusterProperties, EndpointProperties, JsonSerializer, Result, ServiceProperties, UriProperties,
};
use wayfinder_store::{Coordination, FileStore, InMemoryCoordination, InMemoryEnsemble, PropertyStore};

pub const SERVICE: &str = "profiles";
pub const CLUSTER: &str = "profile-cluster";

pub fn service() -> ServiceProperties {
    ServiceProperties::new(SERVICE, CLUSTER, "/profiles")
}

pub fn endpoints(uris: &[(&str, f64)]) -> UriProperties {
    uris.iter().fold(UriProperties::new(CLUSTER), |acc, (uri, weight)| {
        acc.with_endpoint(*uri, EndpointProperties::with_weight(*weight))
    })
}

pub fn partitioned(partitions: &[u32]) -> EndpointProperties {
    EndpointProperties {
        weight: 1.0,
        partitions: partitions.iter().map(|p| (*p, 1.0)).collect::<BTreeMap<u32, f64>>(),
    }
}

pub fn publish_service(ensemble: &InMemoryEnsemble, service: &ServiceProperties) {
    let path = format!("/d2/services/{}", service.service_name);
    ensemble.write(&path, serde_json::to_vec(service).unwrap());
}

pub fn publish_cluster(ensemble: &InMemoryEnsemble, cluster: &ClusterProperties) {
    let path = format!("/d2/clusters/{}", cluster.cluster_name);
    ensemble.write(&path, serde_json::to_vec(cluster).unwrap());
}

/// Writes a persistent announcement that survives session expiry.
pub fn publish_uris(ensemble: &InMemoryEnsemble, uris: &UriProperties) {
    let path = format!("/d2/uris/{}/ephemeral-fixture", uris.cluster_name);
    ensemble.write(&path, serde_json::to_vec(uris).unwrap());
}

/// Publishes a service, its cluster and the cluster's endpoints.
pub fn publish_all(ensemble: &InMemoryEnsemble, service: &ServiceProperties, cluster: &ClusterProperties, uris: &UriProperties) {
    publish_service(ensemble, service);
    publish_cluster(ensemble, cluster);
    publish_uris(ensemble, uris);
}

/// Fills the file backup a resolver rooted at `dir` reads from.
pub async fn write_backup(dir: &Path, service: &ServiceProperties, cluster: &ClusterProperties, uris: &UriProperties) {
    let services = FileStore::open(dir.join("services"), Arc::new(JsonSerializer::<ServiceProperties>::new())).unwrap();
    services.put(&service.service_name, service.clone()).await.unwrap();
    let clusters = FileStore::open(dir.join("clusters"), Arc::new(JsonSerializer::<ClusterProperties>::new())).unwrap();
    clusters.put(&cluster.cluster_name, cluster.clone()).await.unwrap();
    let all_uris = FileStore::open(dir.join("uris"), Arc::new(JsonSerializer::<UriProperties>::new())).unwrap();
    all_uris.put(&uris.cluster_name, uris.clone()).await.unwrap();
}

/// Routes `RUST_LOG`-filtered logs to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(backup_dir: &Path) -> SessionConfig {
    init_tracing();
    let mut config = SessionConfig::new("/d2", backup_dir);
    config.initial_connect_timeout = Duration::from_millis(300);
    config.expired_shutdown_delay = Duration::from_millis(50);
    config.load_balancer.resolution_timeout = Duration::from_secs(2);
    config
}

pub fn transports() -> TransportRegistry {
    TransportRegistry::new().with("http", Arc::new(StaticClientFactory))
}

pub fn resolver(ensemble: &InMemoryEnsemble, backup_dir: &Path) -> Resolver {
    Resolver::new(config(backup_dir), Arc::new(ensemble.clone()), transports())
}

/// Hands out in-memory sessions and keeps them for fault injection.
pub struct RecordingFactory {
    pub ensemble: InMemoryEnsemble,
    pub sessions: Mutex<Vec<Arc<InMemoryCoordination>>>,
}

impl RecordingFactory {
    pub fn new(ensemble: InMemoryEnsemble) -> Self {
        Self {
            ensemble,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self, index: usize) -> Arc<InMemoryCoordination> {
        self.sessions.lock()[index].clone()
    }

    pub fn opened(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl CoordinationFactory for RecordingFactory {
    fn create(&self) -> Result<Arc<dyn Coordination>> {
        let session = Arc::new(self.ensemble.client());
        self.sessions.lock().push(session.clone());
        let coordination: Arc<dyn Coordination> = session;
        Ok(coordination)
    }
}

/// Polls `condition` every 10ms until it holds or two seconds pass.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
