use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use wayfinder_common::{ClusterProperties, ServiceProperties, UriProperties};
use wayfinder_metrics::MetricsRegistry;

use crate::control::{ControlCommand, EndpointOverride};
use crate::hasher::RequestHasher;
use crate::partition::PartitionAccessor;
use crate::ring::Ring;
use crate::strategy::AdaptiveStrategy;
use crate::tracker::CallTracker;
use crate::transport::{TransportClient, TransportRegistry, scheme_of};

/// A property the state needs delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Service(String),
    Cluster(String),
    Uris(String),
}

struct ClusterEntry {
    properties: ClusterProperties,
    accessor: Arc<PartitionAccessor>,
}

struct ServiceEntry {
    properties: ServiceProperties,
    strategy: AdaptiveStrategy,
    hasher: Arc<RequestHasher>,
}

/// Endpoint of a ring together with what the request path needs to use it.
#[derive(Debug, Clone)]
pub struct EndpointView {
    pub tracker: Arc<CallTracker>,
    pub transport: Arc<dyn TransportClient>,
}

#[derive(Debug, Clone)]
pub struct PartitionView {
    pub ring: Arc<Ring>,
    pub drop_rate: f64,
    pub endpoints: HashMap<String, EndpointView>,
}

/// Everything needed to resolve requests of one service.
#[derive(Debug, Clone)]
pub struct ServiceView {
    pub properties: ServiceProperties,
    pub cluster: ClusterProperties,
    pub accessor: Arc<PartitionAccessor>,
    pub hasher: Arc<RequestHasher>,
    pub partitions: BTreeMap<u32, PartitionView>,
}

#[derive(Debug, Clone)]
pub enum ServiceStatus {
    /// Some of the service's properties have not been delivered yet
    Pending,
    /// A property is known to be absent
    Missing(String),
    Ready(Arc<ServiceView>),
}

/// Immutable view of the state published to request tasks.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub version: u64,
    pub services: HashMap<String, ServiceStatus>,
}

impl StateSnapshot {
    pub fn status(&self, service: &str) -> Option<&ServiceStatus> {
        self.services.get(service)
    }
}

/// In-memory projection of the delivered properties.
///
/// Owned by the property event loop. Every map distinguishes "not delivered
/// yet" (no entry) from "delivered as absent" (`None`).
pub struct LoadBalancerState {
    transports: TransportRegistry,
    metrics: Arc<MetricsRegistry>,
    listened_services: BTreeSet<String>,
    listened_clusters: BTreeSet<String>,
    services: HashMap<String, Option<ServiceEntry>>,
    clusters: HashMap<String, Option<ClusterEntry>>,
    uris: HashMap<String, Option<UriProperties>>,
    overrides: HashMap<String, EndpointOverride>,
    pending_controls: Vec<ControlCommand>,
    clients: HashMap<String, Arc<dyn TransportClient>>,
    version: u64,
}

impl LoadBalancerState {
    pub fn new(transports: TransportRegistry, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            transports,
            metrics,
            listened_services: BTreeSet::new(),
            listened_clusters: BTreeSet::new(),
            services: HashMap::new(),
            clusters: HashMap::new(),
            uris: HashMap::new(),
            overrides: HashMap::new(),
            pending_controls: Vec::new(),
            clients: HashMap::new(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn listened_services(&self) -> Vec<String> {
        self.listened_services.iter().cloned().collect()
    }

    /// Registers interest in a service. Returns the keys to subscribe.
    pub fn listen_to_service(&mut self, name: &str) -> Vec<PropertyKey> {
        if !self.listened_services.insert(name.to_string()) {
            return Vec::new();
        }
        debug!("Listening to service {}", name);
        self.version += 1;
        vec![PropertyKey::Service(name.to_string())]
    }

    /// Registers interest in a cluster. Returns the keys to subscribe.
    pub fn listen_to_cluster(&mut self, name: &str) -> Vec<PropertyKey> {
        if !self.listened_clusters.insert(name.to_string()) {
            return Vec::new();
        }
        debug!("Listening to cluster {}", name);
        vec![
            PropertyKey::Cluster(name.to_string()),
            PropertyKey::Uris(name.to_string()),
        ]
    }

    /// Applies a service delivery. Returns further keys to subscribe.
    ///
    /// A changed service gets a fresh strategy, so every endpoint's health
    /// starts over.
    pub fn on_service(&mut self, name: &str, value: Option<ServiceProperties>, now: Instant) -> Vec<PropertyKey> {
        let current = self.services.get(name).map(|e| e.as_ref().map(|e| &e.properties));
        if current == Some(value.as_ref()) {
            return Vec::new();
        }

        let Some(properties) = value else {
            info!("Service {} removed", name);
            self.services.insert(name.to_string(), None);
            self.version += 1;
            return Vec::new();
        };

        let hasher = match RequestHasher::new(name, &properties.hash_method) {
            Ok(hasher) => Arc::new(hasher),
            Err(e) => {
                warn!("Rejected properties of service {}: {}", name, e);
                return Vec::new();
            }
        };
        let cluster = properties.cluster_name.clone();
        info!("Service {} updated (cluster {})", name, cluster);
        let strategy = AdaptiveStrategy::new(properties.strategy.clone());
        self.services.insert(
            name.to_string(),
            Some(ServiceEntry {
                properties,
                strategy,
                hasher,
            }),
        );

        let keys = self.listen_to_cluster(&cluster);
        self.rebuild_service(name, now);
        self.sync_clients();
        self.version += 1;
        keys
    }

    pub fn on_cluster(&mut self, name: &str, value: Option<ClusterProperties>, now: Instant) {
        let current = self.clusters.get(name).map(|e| e.as_ref().map(|e| &e.properties));
        if current == Some(value.as_ref()) {
            return;
        }

        let entry = match value {
            Some(properties) => match PartitionAccessor::new(name, &properties.partition) {
                Ok(accessor) => Some(ClusterEntry {
                    properties,
                    accessor: Arc::new(accessor),
                }),
                Err(e) => {
                    warn!("Rejected properties of cluster {}: {}", name, e);
                    return;
                }
            },
            None => None,
        };
        info!("Cluster {} {}", name, if entry.is_some() { "updated" } else { "removed" });
        self.clusters.insert(name.to_string(), entry);
        self.rebuild_cluster(name, now);
    }

    pub fn on_uris(&mut self, cluster: &str, value: Option<UriProperties>, now: Instant) {
        if self.uris.get(cluster) == Some(&value) {
            return;
        }
        debug!(
            "Cluster {} has {} endpoints",
            cluster,
            value.as_ref().map(|u| u.endpoints.len()).unwrap_or(0)
        );
        self.uris.insert(cluster.to_string(), value);
        self.rebuild_cluster(cluster, now);
    }

    /// Queues an operator command for the next window.
    pub fn queue_control(&mut self, command: ControlCommand) {
        self.pending_controls.push(command);
    }

    /// Applies queued controls and closes the window of every due strategy.
    ///
    /// Returns whether any ring changed.
    pub fn tick(&mut self, now: Instant, force: bool) -> bool {
        let mut changed = false;

        for command in std::mem::take(&mut self.pending_controls) {
            info!("Applying {:?}", command);
            let entry = self.overrides.entry(command.uri().to_string()).or_default();
            entry.apply(&command);
            if entry.is_default() {
                self.overrides.remove(command.uri());
            }
            for (name, service) in self.services.iter_mut() {
                if let Some(service) = service {
                    if service.strategy.apply_control(&command) {
                        self.metrics.record_ring_rebuild(name);
                        changed = true;
                    }
                }
            }
        }

        for (name, service) in self.services.iter_mut() {
            let Some(service) = service else {
                continue;
            };
            for partition in service.strategy.update(now, force) {
                debug!("Rebuilt ring of {} partition {}", name, partition);
                self.metrics.record_ring_rebuild(name);
                changed = true;
            }
        }

        if changed {
            self.version += 1;
        }
        changed
    }

    fn rebuild_cluster(&mut self, cluster: &str, now: Instant) {
        let dependents: Vec<String> = self
            .services
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .as_ref()
                    .filter(|e| e.properties.cluster_name == cluster)
                    .map(|_| name.clone())
            })
            .collect();
        for name in dependents {
            self.rebuild_service(&name, now);
        }
        self.sync_clients();
        self.version += 1;
    }

    /// Recomputes the endpoint set of every partition of `name`.
    ///
    /// Nothing is populated until both the cluster and its endpoint set have
    /// been delivered, so the first real set is the one that starts healthy.
    fn rebuild_service(&mut self, name: &str, now: Instant) {
        let Some(Some(service)) = self.services.get_mut(name) else {
            return;
        };
        let cluster_name = &service.properties.cluster_name;
        if !self.clusters.contains_key(cluster_name) || !self.uris.contains_key(cluster_name) {
            return;
        }
        let cluster = self.clusters.get(cluster_name).and_then(|c| c.as_ref());
        let uris = self.uris.get(cluster_name).and_then(|u| u.as_ref());
        let max_partition = cluster.map(|c| c.accessor.max_partition_id()).unwrap_or(0);

        for partition in 0..=max_partition {
            let endpoints = select_endpoints(
                &self.transports,
                &service.properties,
                cluster.map(|c| &c.properties),
                uris,
                partition,
            );
            if service
                .strategy
                .set_partition_endpoints(partition, &endpoints, &self.overrides, now)
            {
                self.metrics.record_ring_rebuild(name);
            }
        }
        service.strategy.retain_partitions(&(0..=max_partition).collect());
    }

    /// Creates transport clients for new endpoints and shuts down those no
    /// partition uses anymore.
    fn sync_clients(&mut self) {
        let used: BTreeSet<String> = self
            .services
            .values()
            .flatten()
            .flat_map(|s| s.strategy.partitions())
            .flat_map(|(_, p)| p.endpoints().map(|(uri, _)| uri.clone()))
            .collect();

        self.clients.retain(|uri, client| {
            let keep = used.contains(uri);
            if !keep {
                debug!("Releasing transport client for {}", uri);
                client.shutdown();
            }
            keep
        });

        for uri in used {
            if self.clients.contains_key(&uri) {
                continue;
            }
            let Some(factory) = self.transports.factory_for(&uri) else {
                continue;
            };
            match factory.client(&uri) {
                Ok(client) => {
                    self.clients.insert(uri, client);
                }
                Err(e) => warn!("Failed to create transport client for {}: {}", uri, e),
            }
        }
    }

    /// Builds the view published to request tasks.
    pub fn snapshot(&self) -> StateSnapshot {
        let services = self
            .listened_services
            .iter()
            .map(|name| (name.clone(), self.status_of(name)))
            .collect();
        StateSnapshot {
            version: self.version,
            services,
        }
    }

    fn status_of(&self, name: &str) -> ServiceStatus {
        let service = match self.services.get(name) {
            None => return ServiceStatus::Pending,
            Some(None) => return ServiceStatus::Missing(format!("service {} not found", name)),
            Some(Some(service)) => service,
        };
        let cluster_name = &service.properties.cluster_name;
        let cluster = match self.clusters.get(cluster_name) {
            None => return ServiceStatus::Pending,
            Some(None) => return ServiceStatus::Missing(format!("cluster {} not found", cluster_name)),
            Some(Some(cluster)) => cluster,
        };
        if !self.uris.contains_key(cluster_name) {
            return ServiceStatus::Pending;
        }

        let partitions = service
            .strategy
            .partitions()
            .map(|(id, partition)| {
                let endpoints = partition
                    .endpoints()
                    .filter_map(|(uri, state)| {
                        let transport = self.clients.get(uri)?.clone();
                        Some((
                            uri.clone(),
                            EndpointView {
                                tracker: state.tracker().clone(),
                                transport,
                            },
                        ))
                    })
                    .collect();
                let view = PartitionView {
                    ring: partition.ring().clone(),
                    drop_rate: partition.drop_rate(),
                    endpoints,
                };
                (*id, view)
            })
            .collect();

        ServiceStatus::Ready(Arc::new(ServiceView {
            properties: service.properties.clone(),
            cluster: cluster.properties.clone(),
            accessor: cluster.accessor.clone(),
            hasher: service.hasher.clone(),
            partitions,
        }))
    }
}

/// Endpoints of `partition` eligible for the service's ring.
///
/// Banned endpoints and endpoints without a transport are left out. With
/// prioritized schemes, only the first scheme that has endpoints is used.
fn select_endpoints(
    transports: &TransportRegistry,
    service: &ServiceProperties,
    cluster: Option<&ClusterProperties>,
    uris: Option<&UriProperties>,
    partition: u32,
) -> BTreeMap<String, f64> {
    let Some(uris) = uris else {
        return BTreeMap::new();
    };
    let candidates: BTreeMap<&str, f64> = uris
        .endpoints_in_partition(partition)
        .into_iter()
        .filter(|(uri, _)| !service.is_banned(uri) && !cluster.is_some_and(|c| c.is_banned(uri)))
        .filter(|(uri, _)| {
            let supported = transports.factory_for(uri).is_some();
            if !supported {
                debug!("No transport for {}, leaving it out of {}", uri, service.service_name);
            }
            supported
        })
        .collect();

    if service.prioritized_schemes.is_empty() {
        return owned(candidates.into_iter().collect());
    }
    for scheme in &service.prioritized_schemes {
        let matching: Vec<(&str, f64)> = candidates
            .iter()
            .filter(|(uri, _)| scheme_of(uri) == Some(scheme.as_str()))
            .map(|(uri, w)| (*uri, *w))
            .collect();
        if !matching.is_empty() {
            return owned(matching);
        }
    }
    BTreeMap::new()
}

fn owned(entries: Vec<(&str, f64)>) -> BTreeMap<String, f64> {
    entries.into_iter().map(|(uri, w)| (uri.to_string(), w)).collect()
}
