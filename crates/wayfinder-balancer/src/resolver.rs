use std::collections::BTreeMap;
use std::sync::Arc;
use wayfinder_common::{Result, UriProperties};
use wayfinder_metrics::{MetricsRegistry, MetricsSnapshot};

use crate::balancer::{HostToKeyMapper, RequestContext, ResolvedClient};
use crate::config::SessionConfig;
use crate::control::ControlCommand;
use crate::partition::PartitionAccessor;
use crate::ring::Ring;
use crate::session::{CoordinationFactory, SessionCoordinator, SessionPhase};
use crate::transport::TransportRegistry;

/// Entry point for callers: logical service URI in, transport client out.
pub struct Resolver {
    coordinator: SessionCoordinator,
    metrics: Arc<MetricsRegistry>,
}

impl Resolver {
    pub fn new(config: SessionConfig, factory: Arc<dyn CoordinationFactory>, transports: TransportRegistry) -> Self {
        Self::with_metrics(config, factory, transports, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(
        config: SessionConfig,
        factory: Arc<dyn CoordinationFactory>,
        transports: TransportRegistry,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            coordinator: SessionCoordinator::new(config, factory, transports, metrics.clone()),
            metrics,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.coordinator.start().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.coordinator.shutdown().await
    }

    pub fn phase(&self) -> SessionPhase {
        self.coordinator.phase()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.coordinator.session_id()
    }

    /// Resolves `svc://<service>/<path>` to an endpoint of the service.
    pub async fn resolve(&self, service_uri: &str, context: &RequestContext) -> Result<ResolvedClient> {
        self.coordinator.balancer()?.get_client(service_uri, context).await
    }

    pub async fn rings(&self, service_uri: &str) -> Result<BTreeMap<u32, Arc<Ring>>> {
        self.coordinator.balancer()?.rings(service_uri).await
    }

    pub async fn partition_accessor(&self, service: &str) -> Result<Arc<PartitionAccessor>> {
        self.coordinator.balancer()?.partition_accessor(service).await
    }

    pub async fn partition_information(
        &self,
        service_uri: &str,
        keys: &[String],
        limit: usize,
        hash: u32,
    ) -> Result<HostToKeyMapper> {
        self.coordinator
            .balancer()?
            .partition_information(service_uri, keys, limit, hash)
            .await
    }

    pub fn mark_down(&self, uri: &str) -> Result<()> {
        self.coordinator.control(ControlCommand::MarkDown { uri: uri.to_string() })
    }

    pub fn mark_up(&self, uri: &str) -> Result<()> {
        self.coordinator.control(ControlCommand::MarkUp { uri: uri.to_string() })
    }

    /// Overrides the announced weight of `uri`; `None` restores it.
    pub fn set_weight(&self, uri: &str, weight: Option<f64>) -> Result<()> {
        self.coordinator.control(ControlCommand::SetWeight {
            uri: uri.to_string(),
            weight,
        })
    }

    /// Closes the current health window now instead of at the next interval.
    pub async fn run_window(&self) -> Result<bool> {
        self.coordinator.balancer()?.run_window().await
    }

    pub async fn announce(&self, cluster: &str, uris: UriProperties) -> Result<()> {
        self.coordinator.announce(cluster, uris).await
    }

    pub async fn withdraw(&self, cluster: &str) -> Result<()> {
        self.coordinator.withdraw(cluster).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
