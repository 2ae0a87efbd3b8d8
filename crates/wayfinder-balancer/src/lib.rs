//! Wayfinder Load Balancer
//!
//! Client-side service discovery and health-adaptive load balancing.
//!
//! A [`Resolver`] turns `svc://<service>/<path>` into an endpoint of the
//! service's cluster. Behind it a [`SessionCoordinator`] owns the connection
//! to the coordination service and the [`LoadBalancer`] fed by it; the load
//! balancer's event loop keeps one consistent-hash [`Ring`] per service
//! partition, rebuilt every window from the endpoints' observed health.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wayfinder_balancer::{RequestContext, Resolver, SessionConfig, StaticClientFactory, TransportRegistry};
//! use wayfinder_store::InMemoryEnsemble;
//!
//! # async fn example() -> wayfinder_common::Result<()> {
//! let transports = TransportRegistry::new().with("http", Arc::new(StaticClientFactory));
//! let resolver = Resolver::new(
//!     SessionConfig::new("/d2", "/var/lib/wayfinder"),
//!     Arc::new(InMemoryEnsemble::new()),
//!     transports,
//! );
//! resolver.start().await?;
//!
//! let client = resolver.resolve("svc://profiles/members/42", &RequestContext::default()).await?;
//! println!("calling {}", client.target_uri());
//! resolver.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod control;
pub mod hasher;
pub mod partition;
pub mod resolver;
pub mod ring;
pub mod session;
pub mod state;
pub mod stores;
pub mod strategy;
pub mod tracker;
pub mod transport;

pub use balancer::{HostToKeyMapper, KeysAndHosts, LoadBalancer, RequestContext, ResolvedClient, SERVICE_SCHEME};
pub use config::{LoadBalancerConfig, SessionConfig};
pub use control::{ControlCommand, EndpointOverride, StandingOverrides};
pub use hasher::RequestHasher;
pub use partition::PartitionAccessor;
pub use resolver::Resolver;
pub use ring::Ring;
pub use session::{CoordinationFactory, SessionCoordinator, SessionPhase};
pub use state::{LoadBalancerState, PropertyKey, ServiceStatus, StateSnapshot};
pub use stores::DiscoveryStores;
pub use strategy::{AdaptiveStrategy, PartitionStrategy, Recovery};
pub use tracker::{CallOutcome, CallTracker, ErrorType, WindowStats};
pub use transport::{StaticClient, StaticClientFactory, TransportClient, TransportClientFactory, TransportRegistry};
