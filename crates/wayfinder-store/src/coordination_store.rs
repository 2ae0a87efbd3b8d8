use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use wayfinder_common::{PropertyKind, PropertySerializer, Result, UriProperties};

use crate::coordination::{Coordination, CoordinationEvent, CreateMode, NodeLayout};
use crate::store::{ChangeListener, PropertyStore};

/// Folds the records of all children of a key, in creation order, into one.
pub type Merger<T> = Arc<dyn Fn(&str, Vec<T>) -> T + Send + Sync>;

/// Merger for endpoint sets announced by several sessions.
pub fn uri_merger() -> Merger<UriProperties> {
    Arc::new(|cluster: &str, parts: Vec<UriProperties>| UriProperties::merged(cluster, parts))
}

/// Name prefix of the ephemeral child each session announces under.
pub const EPHEMERAL_PREFIX: &str = "ephemeral-";

/// Property store backed by the coordination service.
///
/// Single-node kinds keep one record per key at `<base>/<kind>/<key>`. Merged
/// kinds keep one ephemeral child per announcing session below that node and
/// present their merge. Every read arms a watch; when it fires the change
/// listener is told which key to re-read.
pub struct CoordinationStore<T> {
    coordination: Arc<dyn Coordination>,
    layout: NodeLayout,
    kind: PropertyKind,
    serializer: Arc<dyn PropertySerializer<T>>,
    merger: Option<Merger<T>>,
    listener: RwLock<Option<ChangeListener>>,
    /// Children this store announced, by key
    announced: Mutex<HashMap<String, Vec<String>>>,
}

impl<T> CoordinationStore<T> {
    pub fn single(
        coordination: Arc<dyn Coordination>,
        layout: NodeLayout,
        kind: PropertyKind,
        serializer: Arc<dyn PropertySerializer<T>>,
    ) -> Self {
        Self {
            coordination,
            layout,
            kind,
            serializer,
            merger: None,
            listener: RwLock::new(None),
            announced: Mutex::new(HashMap::new()),
        }
    }

    pub fn merged(
        coordination: Arc<dyn Coordination>,
        layout: NodeLayout,
        kind: PropertyKind,
        serializer: Arc<dyn PropertySerializer<T>>,
        merger: Merger<T>,
    ) -> Self {
        Self {
            merger: Some(merger),
            ..Self::single(coordination, layout, kind, serializer)
        }
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Routes a watch notification to the change listener.
    ///
    /// Returns `true` if the path belonged to this store.
    pub fn handle_event(&self, event: &CoordinationEvent) -> bool {
        let Some(key) = event.path().and_then(|p| self.layout.key_for_path(self.kind, p)) else {
            return false;
        };
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&key);
        }
        true
    }

    async fn get_merged(&self, key: &str, merger: &Merger<T>) -> Result<Option<T>> {
        let path = self.layout.node_path(self.kind, key);
        let Some(children) = self.coordination.get_children(&path, true).await? else {
            return Ok(None);
        };

        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            let child_path = format!("{}/{}", path, child);
            // Children may vanish between listing and reading.
            let Some(bytes) = self.coordination.get_data(&child_path, true).await? else {
                continue;
            };
            match self.serializer.from_bytes(key, &bytes) {
                Ok(part) => parts.push(part),
                Err(e) => warn!("Skipping malformed announcement {}: {}", child_path, e),
            }
        }
        Ok(Some(merger(key, parts)))
    }
}

#[async_trait]
impl<T> PropertyStore<T> for CoordinationStore<T>
where
    T: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<T>> {
        if let Some(merger) = &self.merger {
            return self.get_merged(key, merger).await;
        }
        let path = self.layout.node_path(self.kind, key);
        match self.coordination.get_data(&path, true).await? {
            Some(bytes) => self.serializer.from_bytes(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// For merged kinds this announces a new ephemeral child owned by the
    /// current session.
    async fn put(&self, key: &str, value: T) -> Result<()> {
        let bytes = self.serializer.to_bytes(&value)?;
        let path = self.layout.node_path(self.kind, key);
        if self.merger.is_some() {
            let prefix = format!("{}/{}", path, EPHEMERAL_PREFIX);
            let created = self
                .coordination
                .create(&prefix, bytes, CreateMode::EphemeralSequential)
                .await?;
            self.announced
                .lock()
                .entry(key.to_string())
                .or_default()
                .push(created);
            Ok(())
        } else {
            self.coordination.set_data(&path, bytes).await
        }
    }

    /// For merged kinds this withdraws only this store's announcements.
    async fn remove(&self, key: &str) -> Result<()> {
        if self.merger.is_some() {
            let children = self.announced.lock().remove(key).unwrap_or_default();
            for child in children {
                self.coordination.delete(&child).await?;
            }
            Ok(())
        } else {
            let path = self.layout.node_path(self.kind, key);
            self.coordination.delete(&path).await
        }
    }

    fn set_change_listener(&self, listener: Option<ChangeListener>) {
        *self.listener.write() = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_coordination::InMemoryEnsemble;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use wayfinder_common::{EndpointProperties, JsonSerializer, ServiceProperties};

    async fn connected(ensemble: &InMemoryEnsemble) -> (Arc<dyn Coordination>, mpsc::UnboundedReceiver<CoordinationEvent>) {
        let client = ensemble.client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        rx.recv().await.unwrap();
        (Arc::new(client), rx)
    }

    #[tokio::test]
    async fn test_single_record_round_trip() {
        let ensemble = InMemoryEnsemble::new();
        let (coordination, _rx) = connected(&ensemble).await;
        let store = CoordinationStore::single(
            coordination,
            NodeLayout::new("/d2"),
            PropertyKind::Service,
            Arc::new(JsonSerializer::<ServiceProperties>::new()),
        );

        let service = ServiceProperties::new("profiles", "c1", "/profiles");
        store.put("profiles", service.clone()).await.unwrap();
        assert!(ensemble.read("/d2/services/profiles").is_some());
        assert_eq!(store.get("profiles").await.unwrap(), Some(service));

        store.remove("profiles").await.unwrap();
        assert_eq!(store.get("profiles").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_merged_announcements() {
        let ensemble = InMemoryEnsemble::new();
        let (first, _rx1) = connected(&ensemble).await;
        let (second, _rx2) = connected(&ensemble).await;
        let serializer = Arc::new(JsonSerializer::<UriProperties>::new());
        let layout = NodeLayout::new("/d2");

        let store_a = CoordinationStore::merged(first, layout.clone(), PropertyKind::Uris, serializer.clone(), uri_merger());
        let store_b = CoordinationStore::merged(second, layout, PropertyKind::Uris, serializer, uri_merger());

        store_a
            .put("c1", UriProperties::new("c1").with_endpoint("http://a:1/", EndpointProperties::default()))
            .await
            .unwrap();
        store_b
            .put("c1", UriProperties::new("c1").with_endpoint("http://b:1/", EndpointProperties::with_weight(2.0)))
            .await
            .unwrap();

        let merged = store_a.get("c1").await.unwrap().unwrap();
        assert_eq!(merged.endpoints.len(), 2);
        assert_eq!(merged.endpoints["http://b:1/"].weight, 2.0);

        store_a.remove("c1").await.unwrap();
        let merged = store_b.get("c1").await.unwrap().unwrap();
        assert_eq!(merged.endpoints.len(), 1);
        assert!(merged.endpoints.contains_key("http://b:1/"));
    }

    #[tokio::test]
    async fn test_malformed_child_is_skipped() {
        let ensemble = InMemoryEnsemble::new();
        let (coordination, _rx) = connected(&ensemble).await;
        let store = CoordinationStore::merged(
            coordination,
            NodeLayout::new("/d2"),
            PropertyKind::Uris,
            Arc::new(JsonSerializer::<UriProperties>::new()),
            uri_merger(),
        );

        store
            .put("c1", UriProperties::new("c1").with_endpoint("http://a:1/", EndpointProperties::default()))
            .await
            .unwrap();
        ensemble.write("/d2/uris/c1/garbage", b"{not json".to_vec());

        let merged = store.get("c1").await.unwrap().unwrap();
        assert_eq!(merged.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_routes_to_listener() {
        let ensemble = InMemoryEnsemble::new();
        let (coordination, mut rx) = connected(&ensemble).await;
        let store = CoordinationStore::single(
            coordination,
            NodeLayout::new("/d2"),
            PropertyKind::Service,
            Arc::new(JsonSerializer::<ServiceProperties>::new()),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        store.set_change_listener(Some(Arc::new(move |key: &str| {
            assert_eq!(key, "profiles");
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert_eq!(store.get("profiles").await.unwrap(), None);
        ensemble.write("/d2/services/profiles", b"{}".to_vec());

        let event = rx.recv().await.unwrap();
        assert!(store.handle_event(&event));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!store.handle_event(&CoordinationEvent::NodeDataChanged("/d2/clusters/c1".to_string())));
    }
}
