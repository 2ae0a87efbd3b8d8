//! Property event loop and request-path resolution.
//!
//! One task owns the [`LoadBalancerState`]. Property deliveries, operator
//! commands and window ticks all arrive on a single unbounded channel, so
//! they are applied strictly one at a time. After every change the task
//! publishes a fresh [`StateSnapshot`]; request tasks only ever read that
//! snapshot and never wait on the loop except while a service is still
//! pending.

use arc_swap::ArcSwap;
use http::Uri;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use wayfinder_common::{ClusterProperties, DiscoveryError, Result, ServiceProperties, UriProperties};
use wayfinder_metrics::{MetricsRegistry, ResolutionOutcome};
use wayfinder_store::{CoordinationEvent, PropertyEvent, SubscriptionId};

use crate::config::LoadBalancerConfig;
use crate::control::ControlCommand;
use crate::partition::PartitionAccessor;
use crate::ring::Ring;
use crate::state::{LoadBalancerState, PropertyKey, ServiceStatus, ServiceView, StateSnapshot};
use crate::stores::DiscoveryStores;
use crate::tracker::{CallOutcome, CallTracker};
use crate::transport::{TransportClient, TransportRegistry};

/// URI scheme of logical service addresses, `svc://<service>/<path>`.
pub const SERVICE_SCHEME: &str = "svc";

/// Per-request routing hints.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Send to this endpoint if it serves the request's partition
    pub target_host: Option<String>,
    /// Sticky key overriding the service's request hasher
    pub hash_key: Option<String>,
}

impl RequestContext {
    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    pub fn with_hash_key(mut self, key: impl Into<String>) -> Self {
        self.hash_key = Some(key.into());
        self
    }
}

/// Endpoint chosen for one request.
#[derive(Debug, Clone)]
pub struct ResolvedClient {
    endpoint: String,
    partition: u32,
    target: String,
    transport: Arc<dyn TransportClient>,
    tracker: Arc<CallTracker>,
}

impl ResolvedClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// The request rewritten onto the chosen endpoint.
    pub fn target_uri(&self) -> &str {
        &self.target
    }

    pub fn transport(&self) -> &Arc<dyn TransportClient> {
        &self.transport
    }

    /// Reports how the call went; this feeds the endpoint's health.
    pub fn record(&self, latency: Duration, outcome: CallOutcome) {
        self.tracker.record(latency, outcome);
    }
}

/// Keys of one partition and the hosts ranked to serve them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeysAndHosts {
    pub keys: Vec<String>,
    pub hosts: Vec<String>,
}

/// Result of [`LoadBalancer::partition_information`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostToKeyMapper {
    /// Keys the partition accessor rejected
    pub unmapped_keys: Vec<String>,
    pub partitions: BTreeMap<u32, KeysAndHosts>,
    /// Partitions whose ring had fewer distinct hosts than requested
    pub partitions_without_enough_hosts: BTreeSet<u32>,
}

impl HostToKeyMapper {
    /// Host of rank `rank` for `partition`, if the ring had that many.
    pub fn host(&self, partition: u32, rank: usize) -> Option<&str> {
        self.partitions
            .get(&partition)
            .and_then(|p| p.hosts.get(rank))
            .map(String::as_str)
    }
}

enum LoopEvent {
    Service(String, Option<ServiceProperties>),
    Cluster(String, Option<ClusterProperties>),
    Uris(String, Option<UriProperties>),
    Listen(String),
    Control(ControlCommand),
    Tick { ack: oneshot::Sender<bool> },
    Shutdown(oneshot::Sender<()>),
}

/// Client-side load balancer of one coordination session.
pub struct LoadBalancer {
    events: mpsc::UnboundedSender<LoopEvent>,
    snapshot: Arc<ArcSwap<StateSnapshot>>,
    versions: watch::Receiver<u64>,
    stores: DiscoveryStores,
    metrics: Arc<MetricsRegistry>,
    config: LoadBalancerConfig,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    /// Spawns the property event loop.
    ///
    /// # Arguments
    /// * `stores` - Property pipelines feeding the loop
    /// * `transports` - Transport factories by URI scheme
    /// * `metrics` - Registry receiving resolution metrics
    /// * `config` - Tick interval and resolution timeout
    pub fn new(
        stores: DiscoveryStores,
        transports: TransportRegistry,
        metrics: Arc<MetricsRegistry>,
        config: LoadBalancerConfig,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(ArcSwap::from_pointee(StateSnapshot::default()));
        let (version_tx, versions) = watch::channel(0);

        let event_loop = EventLoop {
            state: LoadBalancerState::new(transports, metrics.clone()),
            stores: stores.clone(),
            events: events.clone(),
            snapshot: snapshot.clone(),
            versions: version_tx,
            subscriptions: Vec::new(),
            published: 0,
        };
        let task = tokio::spawn(event_loop.run(rx, config.tick_interval));

        Self {
            events,
            snapshot,
            versions,
            stores,
            metrics,
            config,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn stores(&self) -> &DiscoveryStores {
        &self.stores
    }

    pub async fn start(&self) -> Result<()> {
        self.stores.start().await
    }

    pub async fn enable_primary(&self) -> Result<()> {
        self.stores.enable_primary().await
    }

    pub async fn enable_backup(&self) -> Result<()> {
        self.stores.enable_backup().await
    }

    /// Routes a watch notification of the coordination session.
    pub fn handle_coordination_event(&self, event: &CoordinationEvent) -> bool {
        self.stores.handle_event(event)
    }

    /// Starts fetching a service's properties without resolving anything.
    pub fn listen_to_service(&self, service: &str) -> Result<()> {
        self.send(LoopEvent::Listen(service.to_string()))
    }

    pub fn listened_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.load().services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Picks an endpoint for `request_uri`, `svc://<service>/<path>`.
    ///
    /// Waits up to the resolution timeout for the service's properties. The
    /// endpoint is found by walking the partition's ring clockwise from the
    /// request hash.
    pub async fn get_client(&self, request_uri: &str, context: &RequestContext) -> Result<ResolvedClient> {
        let started = Instant::now();
        let request = parse_service_uri(request_uri)?;
        let service = request.host().unwrap_or_default();
        let view = self.wait_for_service(service).await?;

        let partition = match view.accessor.partition_id(&request) {
            Ok(partition) => partition,
            Err(e) => {
                self.metrics.record_failure(service, ResolutionOutcome::PartitionError);
                return Err(e);
            }
        };
        let Some(partition_view) = view.partitions.get(&partition) else {
            return Err(self.unavailable(service, format!("partition {} has no endpoints", partition)));
        };

        let targeted = context
            .target_host
            .as_deref()
            .filter(|host| partition_view.endpoints.contains_key(*host));

        if targeted.is_none()
            && partition_view.drop_rate > 0.0
            && rand::random::<f64>() < partition_view.drop_rate
        {
            self.metrics.record_failure(service, ResolutionOutcome::Dropped);
            return Err(DiscoveryError::service_unavailable(
                service,
                format!("call dropped at rate {:.2}", partition_view.drop_rate),
            ));
        }

        let endpoint = match targeted {
            Some(host) => Some(host),
            None => {
                let hash = match &context.hash_key {
                    Some(key) => Ring::hash_key(key.as_bytes()),
                    None => view.hasher.hash(&request),
                };
                partition_view
                    .ring
                    .iter_from(hash)
                    .find(|uri| partition_view.endpoints.contains_key(*uri))
            }
        };
        let Some(endpoint) = endpoint else {
            return Err(self.unavailable(service, format!("no available endpoint in partition {}", partition)));
        };
        let Some(chosen) = partition_view.endpoints.get(endpoint) else {
            return Err(self.unavailable(service, format!("no transport for {}", endpoint)));
        };

        self.metrics
            .record_resolution(service, endpoint, started.elapsed().as_micros() as u64);
        Ok(ResolvedClient {
            endpoint: endpoint.to_string(),
            partition,
            target: target_uri(endpoint, &view.properties.path, &request),
            transport: chosen.transport.clone(),
            tracker: chosen.tracker.clone(),
        })
    }

    /// Current ring of every partition of a service.
    pub async fn rings(&self, service_uri: &str) -> Result<BTreeMap<u32, Arc<Ring>>> {
        let request = parse_service_uri(service_uri)?;
        let view = self.wait_for_service(request.host().unwrap_or_default()).await?;
        Ok(view
            .partitions
            .iter()
            .map(|(id, p)| (*id, p.ring.clone()))
            .collect())
    }

    pub async fn partition_accessor(&self, service: &str) -> Result<Arc<PartitionAccessor>> {
        Ok(self.wait_for_service(service).await?.accessor.clone())
    }

    /// Groups `keys` by partition and ranks up to `limit` hosts for each by
    /// walking the partition's ring from `hash`.
    pub async fn partition_information(
        &self,
        service_uri: &str,
        keys: &[String],
        limit: usize,
        hash: u32,
    ) -> Result<HostToKeyMapper> {
        let request = parse_service_uri(service_uri)?;
        let view = self.wait_for_service(request.host().unwrap_or_default()).await?;

        let mut mapper = HostToKeyMapper::default();
        for key in keys {
            match view.accessor.partition_id_for_key(key) {
                Ok(partition) => mapper
                    .partitions
                    .entry(partition)
                    .or_default()
                    .keys
                    .push(key.clone()),
                Err(e) => {
                    debug!("Key {} not mapped: {}", key, e);
                    mapper.unmapped_keys.push(key.clone());
                }
            }
        }

        for (partition, entry) in mapper.partitions.iter_mut() {
            if let Some(p) = view.partitions.get(partition) {
                entry.hosts = p
                    .ring
                    .iter_from(hash)
                    .filter(|uri| p.endpoints.contains_key(*uri))
                    .take(limit)
                    .map(str::to_string)
                    .collect();
            }
            if entry.hosts.len() < limit {
                mapper.partitions_without_enough_hosts.insert(*partition);
            }
        }
        Ok(mapper)
    }

    /// Queues an operator command; it takes effect at the next window.
    pub fn control(&self, command: ControlCommand) -> Result<()> {
        self.send(LoopEvent::Control(command))
    }

    /// Closes the current window of every strategy right away.
    ///
    /// Returns whether any ring changed.
    pub async fn run_window(&self) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        self.send(LoopEvent::Tick { ack })?;
        done.await.map_err(|_| DiscoveryError::ShutDown)
    }

    /// Stops accepting resolutions, drains the event loop and stops the
    /// stores. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (ack, done) = oneshot::channel();
        if self.events.send(LoopEvent::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.stores.shutdown().await?;
        info!("Load balancer shut down");
        Ok(())
    }

    fn send(&self, event: LoopEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShutDown);
        }
        self.events.send(event).map_err(|_| DiscoveryError::ShutDown)
    }

    fn unavailable(&self, service: &str, reason: String) -> DiscoveryError {
        self.metrics.record_failure(service, ResolutionOutcome::Unavailable);
        DiscoveryError::service_unavailable(service, reason)
    }

    /// Waits until `service` is ready, listening to it first if needed.
    async fn wait_for_service(&self, service: &str) -> Result<Arc<ServiceView>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShutDown);
        }
        let deadline = tokio::time::Instant::now() + self.config.resolution_timeout;
        let mut versions = self.versions.clone();
        let mut requested = false;

        loop {
            versions.borrow_and_update();
            let snapshot = self.snapshot.load_full();
            match snapshot.status(service) {
                Some(ServiceStatus::Ready(view)) => return Ok(view.clone()),
                Some(ServiceStatus::Missing(reason)) => return Err(self.unavailable(service, reason.clone())),
                Some(ServiceStatus::Pending) => {}
                None if !requested => {
                    self.send(LoopEvent::Listen(service.to_string()))?;
                    requested = true;
                }
                None => {}
            }

            match tokio::time::timeout_at(deadline, versions.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(DiscoveryError::ShutDown),
                Err(_) => {
                    return Err(self.unavailable(
                        service,
                        format!(
                            "properties not available within {}ms",
                            self.config.resolution_timeout.as_millis()
                        ),
                    ));
                }
            }
        }
    }
}

fn parse_service_uri(uri: &str) -> Result<Uri> {
    let parsed: Uri = uri
        .parse()
        .map_err(|e| DiscoveryError::InvalidUri(format!("{}: {}", uri, e)))?;
    if parsed.scheme_str() != Some(SERVICE_SCHEME) {
        return Err(DiscoveryError::InvalidUri(format!(
            "{}: expected scheme {}",
            uri, SERVICE_SCHEME
        )));
    }
    if parsed.host().is_none_or(str::is_empty) {
        return Err(DiscoveryError::InvalidUri(format!("{}: missing service name", uri)));
    }
    Ok(parsed)
}

/// `endpoint` + service path + the request's path and query.
fn target_uri(endpoint: &str, service_path: &str, request: &Uri) -> String {
    let rest = request.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    let rest = if rest == "/" { "" } else { rest };
    let base = endpoint.trim_end_matches('/');
    match service_path.trim_matches('/') {
        "" => format!("{}{}", base, rest),
        path => format!("{}/{}{}", base, path, rest),
    }
}

struct EventLoop {
    state: LoadBalancerState,
    stores: DiscoveryStores,
    events: mpsc::UnboundedSender<LoopEvent>,
    snapshot: Arc<ArcSwap<StateSnapshot>>,
    versions: watch::Sender<u64>,
    subscriptions: Vec<(PropertyKey, SubscriptionId)>,
    published: u64,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopEvent>, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(LoopEvent::Shutdown(ack)) => {
                        self.unsubscribe_all();
                        let _ = ack.send(());
                        break;
                    }
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.state.tick(Instant::now(), false);
                }
            }
            self.publish();
        }
        debug!("Property event loop stopped");
    }

    fn handle(&mut self, event: LoopEvent) {
        let now = Instant::now();
        match event {
            LoopEvent::Service(name, value) => {
                let keys = self.state.on_service(&name, value, now);
                self.subscribe(keys);
            }
            LoopEvent::Cluster(name, value) => self.state.on_cluster(&name, value, now),
            LoopEvent::Uris(name, value) => self.state.on_uris(&name, value, now),
            LoopEvent::Listen(name) => {
                let keys = self.state.listen_to_service(&name);
                self.subscribe(keys);
            }
            LoopEvent::Control(command) => self.state.queue_control(command),
            LoopEvent::Tick { ack } => {
                let changed = self.state.tick(now, true);
                self.publish();
                let _ = ack.send(changed);
            }
            LoopEvent::Shutdown(_) => {}
        }
    }

    fn subscribe(&mut self, keys: Vec<PropertyKey>) {
        for key in keys {
            let events = self.events.clone();
            let id = match &key {
                PropertyKey::Service(name) => self.stores.services.listen(
                    name,
                    Arc::new(move |event: &PropertyEvent<ServiceProperties>| {
                        let _ = events.send(LoopEvent::Service(event.key().to_string(), event.value().cloned()));
                    }),
                ),
                PropertyKey::Cluster(name) => self.stores.clusters.listen(
                    name,
                    Arc::new(move |event: &PropertyEvent<ClusterProperties>| {
                        let _ = events.send(LoopEvent::Cluster(event.key().to_string(), event.value().cloned()));
                    }),
                ),
                PropertyKey::Uris(name) => self.stores.uris.listen(
                    name,
                    Arc::new(move |event: &PropertyEvent<UriProperties>| {
                        let _ = events.send(LoopEvent::Uris(event.key().to_string(), event.value().cloned()));
                    }),
                ),
            };
            self.subscriptions.push((key, id));
        }
    }

    fn unsubscribe_all(&mut self) {
        debug!("Dropping {} property subscriptions", self.subscriptions.len());
        for (key, id) in self.subscriptions.drain(..) {
            match &key {
                PropertyKey::Service(name) => self.stores.services.unlisten(name, id),
                PropertyKey::Cluster(name) => self.stores.clusters.unlisten(name, id),
                PropertyKey::Uris(name) => self.stores.uris.unlisten(name, id),
            }
        }
    }

    fn publish(&mut self) {
        let version = self.state.version();
        if version == self.published {
            return;
        }
        self.snapshot.store(Arc::new(self.state.snapshot()));
        self.published = version;
        self.versions.send_replace(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_uri() {
        assert!(parse_service_uri("svc://profiles/members/1").is_ok());
        assert!(matches!(
            parse_service_uri("http://profiles/members/1"),
            Err(DiscoveryError::InvalidUri(_))
        ));
        assert!(matches!(parse_service_uri("not a uri"), Err(DiscoveryError::InvalidUri(_))));
    }

    #[test]
    fn test_target_uri() {
        let request: Uri = "svc://profiles/members/1?fields=name".parse().unwrap();
        assert_eq!(
            target_uri("http://a:1/", "/profiles", &request),
            "http://a:1/profiles/members/1?fields=name"
        );

        let bare: Uri = "svc://profiles".parse().unwrap();
        assert_eq!(target_uri("http://a:1", "/profiles/", &bare), "http://a:1/profiles");
        assert_eq!(target_uri("http://a:1/", "", &request), "http://a:1/members/1?fields=name");
    }

    #[test]
    fn test_host_to_key_mapper_lookup() {
        let mut mapper = HostToKeyMapper::default();
        mapper.partitions.insert(
            0,
            KeysAndHosts {
                keys: vec!["1".to_string()],
                hosts: vec!["http://a:1/".to_string(), "http://b:1/".to_string()],
            },
        );
        assert_eq!(mapper.host(0, 1), Some("http://b:1/"));
        assert_eq!(mapper.host(0, 2), None);
        assert_eq!(mapper.host(1, 0), None);
    }
}
