//! Wayfinder Metrics
//!
//! Lock-free instrumentation shared by the resolver and the load balancer:
//!
//! - [`LatencyHistogram`]: atomic logarithmic histogram with windowed
//!   [`take`](LatencyHistogram::take), used for per-endpoint call statistics
//! - [`MetricsRegistry`]: per-service resolution counters and per-endpoint
//!   selection counts
//! - [`MetricsSnapshot`]: serializable copy of the registry
//!
//! # Usage Example
//!
//! ```rust
//! use wayfinder_metrics::LatencyHistogram;
//!
//! let histogram = LatencyHistogram::new();
//! histogram.record(1_200);
//! histogram.record(800);
//!
//! let window = histogram.take();
//! assert_eq!(window.average(), 1_000.0);
//! assert_eq!(histogram.count(), 0);
//! ```

mod histogram;
mod registry;
mod snapshot;

pub use histogram::{HistogramSnapshot, LatencyHistogram, NUM_HISTOGRAM_BINS};
pub use registry::{MetricsConfig, MetricsRegistry, ResolutionOutcome};
pub use snapshot::{EndpointMetrics, MetricsSnapshot, ServiceMetrics};
