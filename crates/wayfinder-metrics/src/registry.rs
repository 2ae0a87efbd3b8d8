use crate::histogram::LatencyHistogram;
use crate::snapshot::{EndpointMetrics, MetricsSnapshot, ServiceMetrics};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Limits on the registry's per-key tables.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of endpoints tracked
    ///
    /// When exceeded, the least recently selected endpoints are evicted.
    pub max_endpoints: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_endpoints: 1000 }
    }
}

#[derive(Debug, Default)]
struct ServiceStats {
    available: AtomicU64,
    unavailable: AtomicU64,
    dropped: AtomicU64,
    partition_errors: AtomicU64,
    ring_rebuilds: AtomicU64,
    resolution_latency: LatencyHistogram,
}

impl ServiceStats {
    fn snapshot(&self) -> ServiceMetrics {
        let latency = self.resolution_latency.snapshot();
        ServiceMetrics {
            available: self.available.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            partition_errors: self.partition_errors.load(Ordering::Relaxed),
            ring_rebuilds: self.ring_rebuilds.load(Ordering::Relaxed),
            avg_resolution_us: latency.average() as u64,
            p50_resolution_us: latency.percentile(50.0),
            p99_resolution_us: latency.percentile(99.0),
        }
    }
}

#[derive(Debug, Default)]
struct EndpointStats {
    selections: AtomicU64,
    last_selected_ms: AtomicU64,
}

/// Resolution outcome of a single `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Unavailable,
    Dropped,
    PartitionError,
}

/// Thread-safe registry of resolver metrics.
///
/// Counters are lock-free atomics with relaxed ordering. The per-service and
/// per-endpoint tables sit behind `RwLock`s that are only write-locked to add
/// a new key.
///
/// # Example
///
/// ```rust
/// use wayfinder_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_resolution("profiles", "http://10.0.0.1:8080/", 35);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_resolutions, 1);
/// assert_eq!(snapshot.service("profiles").available, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_resolutions: AtomicU64,
    total_failures: AtomicU64,
    store_switches: AtomicU64,
    services: RwLock<HashMap<String, Arc<ServiceStats>>>,
    endpoints: RwLock<HashMap<String, Arc<EndpointStats>>>,
    start_time: Instant,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_resolutions: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            store_switches: AtomicU64::new(0),
            services: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
        }
    }

    fn service(&self, name: &str) -> Arc<ServiceStats> {
        if let Some(stats) = self.services.read().get(name) {
            return stats.clone();
        }
        self.services
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Records a successful resolution of `service` to `endpoint`.
    ///
    /// # Arguments
    /// * `service` - Logical service name
    /// * `endpoint` - URI of the selected endpoint
    /// * `latency_us` - Time spent inside `resolve`, in microseconds
    pub fn record_resolution(&self, service: &str, endpoint: &str, latency_us: u64) {
        self.total_resolutions.fetch_add(1, Ordering::Relaxed);

        let stats = self.service(service);
        stats.available.fetch_add(1, Ordering::Relaxed);
        stats.resolution_latency.record(latency_us);

        let endpoint_stats = {
            let existing = self.endpoints.read().get(endpoint).cloned();
            match existing {
                Some(stats) => stats,
                None => {
                    let mut endpoints = self.endpoints.write();
                    let stats = endpoints.entry(endpoint.to_string()).or_default().clone();
                    if endpoints.len() > self.config.max_endpoints {
                        Self::evict_least_recent(&mut endpoints, self.config.max_endpoints, endpoint);
                    }
                    stats
                }
            }
        };
        endpoint_stats.selections.fetch_add(1, Ordering::Relaxed);
        endpoint_stats
            .last_selected_ms
            .store(self.uptime_ms(), Ordering::Relaxed);
    }

    /// Records a failed resolution of `service`.
    pub fn record_failure(&self, service: &str, outcome: ResolutionOutcome) {
        self.total_resolutions.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let stats = self.service(service);
        let counter = match outcome {
            ResolutionOutcome::Unavailable => &stats.unavailable,
            ResolutionOutcome::Dropped => &stats.dropped,
            ResolutionOutcome::PartitionError => &stats.partition_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ring_rebuild(&self, service: &str) {
        self.service(service)
            .ring_rebuilds
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_switch(&self) {
        self.store_switches.fetch_add(1, Ordering::Relaxed);
    }

    fn evict_least_recent(
        endpoints: &mut HashMap<String, Arc<EndpointStats>>,
        max: usize,
        keep: &str,
    ) {
        let mut entries: Vec<_> = endpoints
            .iter()
            .filter(|(uri, _)| uri.as_str() != keep)
            .map(|(uri, stats)| (uri.clone(), stats.last_selected_ms.load(Ordering::Relaxed)))
            .collect();
        entries.sort_by_key(|&(_, last)| last);

        let to_remove = endpoints.len().saturating_sub(max);
        for (uri, _) in entries.into_iter().take(to_remove) {
            endpoints.remove(&uri);
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let services = self
            .services
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let endpoints = self
            .endpoints
            .read()
            .iter()
            .map(|(uri, stats)| {
                let metrics = EndpointMetrics {
                    uri: uri.clone(),
                    selections: stats.selections.load(Ordering::Relaxed),
                    last_selected_ms: stats.last_selected_ms.load(Ordering::Relaxed),
                };
                (uri.clone(), metrics)
            })
            .collect();

        MetricsSnapshot {
            total_resolutions: self.total_resolutions.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            store_switches: self.store_switches.load(Ordering::Relaxed),
            services,
            endpoints,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
