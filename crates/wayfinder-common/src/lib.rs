//! Wayfinder Common Types
//!
//! Shared building blocks of the Wayfinder service-discovery layer:
//!
//! - [`error`] - the [`DiscoveryError`] taxonomy and [`Result`] alias
//! - [`properties`] - cluster, service and endpoint-set property records
//! - [`serializer`] - byte encoding of property records
//!
//! # Example
//!
//! ```
//! use wayfinder_common::properties::{PropertyRecord, ServiceProperties};
//! use wayfinder_common::serializer::{JsonSerializer, PropertySerializer};
//!
//! let service = ServiceProperties::new("profiles", "profile-cluster", "/profiles");
//! let serializer = JsonSerializer::<ServiceProperties>::new();
//! let bytes = serializer.to_bytes(&service).unwrap();
//! let back = serializer.from_bytes("profiles", &bytes).unwrap();
//! assert_eq!(back.key(), "profiles");
//! ```

pub mod error;
pub mod properties;
pub mod serializer;

pub use error::{DiscoveryError, Result};
pub use properties::{
    ClusterProperties, EndpointProperties, PropertyKind, PropertyRecord, ServiceProperties,
    StrategyProperties, UriProperties,
};
pub use serializer::{JsonSerializer, PropertySerializer};
