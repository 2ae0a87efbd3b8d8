//! Boundary to the coordination service.
//!
//! Nodes are addressed by absolute slash-separated paths. Properties live at
//! `<base>/clusters/<name>`, `<base>/services/<name>` and, one child per
//! announcing session, under `<base>/uris/<cluster>/`.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use wayfinder_common::{PropertyKind, Result};

/// Session state reported by the coordination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SyncConnected,
    /// Connection lost; the session may still be resumed.
    Disconnected,
    /// The session is gone, along with its ephemeral nodes and watches.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    Session(SessionState),
    /// Data of a watched node was created, changed or deleted.
    NodeDataChanged(String),
    /// A child of a watched node was added or removed.
    NodeChildrenChanged(String),
}

impl CoordinationEvent {
    /// Path the event refers to, if it is a watch notification.
    pub fn path(&self) -> Option<&str> {
        match self {
            CoordinationEvent::Session(_) => None,
            CoordinationEvent::NodeDataChanged(path) | CoordinationEvent::NodeChildrenChanged(path) => {
                Some(path)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted when the creating session ends; a monotonically increasing
    /// sequence number is appended to the name.
    EphemeralSequential,
}

/// A client connection to the coordination service.
///
/// Operations fail with `CoordinationTransient` while disconnected and with
/// `CoordinationFatal` once the session has expired or been closed. Watches
/// are one-shot: a `watch = true` read arms at most one notification.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Starts connecting; session and watch events are sent to `events`.
    async fn connect(&self, events: UnboundedSender<CoordinationEvent>) -> Result<()>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<Option<Vec<u8>>>;

    /// Child names (not paths) of `path`, sorted.
    async fn get_children(&self, path: &str, watch: bool) -> Result<Option<Vec<String>>>;

    /// Creates `path`, and any missing parents, returning the actual path.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Replaces the data of `path`, creating it as a persistent node if needed.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Deletes `path`; deleting a missing node succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn session_id(&self) -> Option<u64>;
}

/// Path layout of property nodes below a base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    base_path: String,
}

impl NodeLayout {
    pub fn new(base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        let trimmed = base_path.trim_end_matches('/');
        Self {
            base_path: trimmed.to_string(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn kind_path(&self, kind: PropertyKind) -> String {
        format!("{}/{}", self.base_path, kind.dir_name())
    }

    pub fn node_path(&self, kind: PropertyKind, key: &str) -> String {
        format!("{}/{}/{}", self.base_path, kind.dir_name(), key)
    }

    /// Maps a node path (or a child of one) back to its property key.
    pub fn key_for_path(&self, kind: PropertyKind, path: &str) -> Option<String> {
        let prefix = format!("{}/", self.kind_path(kind));
        let rest = path.strip_prefix(&prefix)?;
        let key = rest.split('/').next()?;
        (!key.is_empty()).then(|| key.to_string())
    }
}
