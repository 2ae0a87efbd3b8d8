//! Wayfinder Property Stores
//!
//! Everything between the coordination service and the load balancer's
//! property event loop:
//!
//! - [`PropertyStore`]: keyed record store, implemented by [`MemoryStore`],
//!   [`FileStore`] (local backup) and [`CoordinationStore`] (primary)
//! - [`Coordination`]: the narrow client interface to the coordination
//!   service, with the in-process [`InMemoryEnsemble`] implementation
//! - [`PropertyEventBus`]: per-key fan-out that suppresses unchanged values
//! - [`TogglingStore`]: primary/backup pair feeding one bus
//!
//! # Data Flow
//!
//! ```text
//! coordination service -> CoordinationStore --+
//!                                             +-> TogglingStore -> PropertyEventBus -> subscribers
//!            backup dir -> FileStore ---------+        |
//!                ^                                     |
//!                +------------- write-through ---------+
//! ```

pub mod bus;
pub mod coordination;
pub mod coordination_store;
pub mod file;
pub mod memory;
pub mod memory_coordination;
pub mod store;
pub mod toggling;

pub use bus::{PropertyEvent, PropertyEventBus, Subscriber, SubscriptionId};
pub use coordination::{Coordination, CoordinationEvent, CreateMode, NodeLayout, SessionState};
pub use coordination_store::{CoordinationStore, EPHEMERAL_PREFIX, Merger, uri_merger};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use memory_coordination::{InMemoryCoordination, InMemoryEnsemble};
pub use store::{ChangeListener, PropertyStore};
pub use toggling::{ActiveStore, TogglingStore};
