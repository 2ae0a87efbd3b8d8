//! In-process coordination service.
//!
//! [`InMemoryEnsemble`] holds the shared node tree; each
//! [`InMemoryCoordination`] is one client session against it. Faults are
//! injected per client ([`disconnect`](InMemoryCoordination::disconnect),
//! [`reconnect`](InMemoryCoordination::reconnect),
//! [`expire_session`](InMemoryCoordination::expire_session)) or for the whole
//! ensemble ([`set_reachable`](InMemoryEnsemble::set_reachable)).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use wayfinder_common::{DiscoveryError, Result};

use crate::coordination::{Coordination, CoordinationEvent, CreateMode, SessionState};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    /// Session owning an ephemeral node
    owner: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Created, or connected while the ensemble was unreachable
    Pending,
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct Session {
    state: ClientState,
    events: Option<UnboundedSender<CoordinationEvent>>,
}

impl Session {
    fn send(&self, event: CoordinationEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    sessions: HashMap<u64, Session>,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
    reachable: bool,
    next_session: u64,
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(DiscoveryError::InvalidUri(format!("bad node path '{}'", path)));
    }
    Ok(())
}

impl EnsembleState {
    fn fire_data(&mut self, path: &str) {
        if let Some(watchers) = self.data_watches.remove(path) {
            self.notify(watchers, CoordinationEvent::NodeDataChanged(path.to_string()));
        }
    }

    fn fire_children(&mut self, parent: &str) {
        if let Some(watchers) = self.child_watches.remove(parent) {
            self.notify(watchers, CoordinationEvent::NodeChildrenChanged(parent.to_string()));
        }
    }

    fn notify(&self, watchers: HashSet<u64>, event: CoordinationEvent) {
        for id in watchers {
            if let Some(session) = self.sessions.get(&id) {
                if session.state == ClientState::Connected {
                    session.send(event.clone());
                }
            }
        }
    }

    fn insert_node(&mut self, path: String, data: Vec<u8>, owner: Option<u64>) {
        self.ensure_parents(&path);
        self.nodes.insert(path.clone(), Node { data, owner });
        self.fire_data(&path);
        if let Some(parent) = parent_of(&path) {
            let parent = parent.to_string();
            self.fire_children(&parent);
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            if self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            self.nodes.insert(
                parent.clone(),
                Node {
                    data: Vec::new(),
                    owner: None,
                },
            );
            if let Some(grandparent) = parent_of(&parent) {
                let grandparent = grandparent.to_string();
                self.fire_children(&grandparent);
            }
        }
    }

    fn remove_node(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_none() {
            return false;
        }
        self.fire_data(path);
        self.fire_children(path);
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_string();
            self.fire_children(&parent);
        }
        true
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn drop_ephemerals(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }
        for watchers in self.data_watches.values_mut().chain(self.child_watches.values_mut()) {
            watchers.remove(&session);
        }
    }

    fn set_state(&mut self, id: u64, state: ClientState, event: Option<SessionState>) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = state;
            if let Some(event) = event {
                session.send(CoordinationEvent::Session(event));
            }
        }
    }
}

/// Shared node tree of the in-process coordination service.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl InMemoryEnsemble {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes: BTreeMap::new(),
                sequences: HashMap::new(),
                sessions: HashMap::new(),
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
                reachable: true,
                next_session: 1,
            })),
        }
    }

    /// Opens a new client session. It connects once `connect` is called.
    pub fn client(&self) -> InMemoryCoordination {
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                state: ClientState::Pending,
                events: None,
            },
        );
        InMemoryCoordination {
            ensemble: self.clone(),
            session: id,
        }
    }

    /// Makes the ensemble unreachable (all connected clients see
    /// `Disconnected`) or reachable again (waiting clients see `SyncConnected`).
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        let ids: Vec<(u64, ClientState)> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.events.is_some())
            .map(|(id, s)| (*id, s.state))
            .collect();
        for (id, client_state) in ids {
            match (reachable, client_state) {
                (false, ClientState::Connected) => {
                    state.set_state(id, ClientState::Disconnected, Some(SessionState::Disconnected))
                }
                (true, ClientState::Pending | ClientState::Disconnected) => {
                    state.set_state(id, ClientState::Connected, Some(SessionState::SyncConnected))
                }
                _ => {}
            }
        }
    }

    /// Number of sessions that are connected right now.
    pub fn connected_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.state == ClientState::Connected)
            .count()
    }

    /// Reads a node directly, bypassing any session.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Writes a persistent node directly, bypassing any session.
    pub fn write(&self, path: &str, data: Vec<u8>) {
        self.state.lock().insert_node(path.to_string(), data, None);
    }

    /// Deletes a node directly, bypassing any session.
    pub fn erase(&self, path: &str) {
        self.state.lock().remove_node(path);
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.state.lock().children_of(path)
    }
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session against an [`InMemoryEnsemble`].
pub struct InMemoryCoordination {
    ensemble: InMemoryEnsemble,
    session: u64,
}

impl InMemoryCoordination {
    fn check_connected(&self, state: &EnsembleState) -> Result<()> {
        match state.sessions.get(&self.session).map(|s| s.state) {
            Some(ClientState::Connected) => Ok(()),
            Some(ClientState::Pending | ClientState::Disconnected) => Err(
                DiscoveryError::CoordinationTransient(format!("session {} not connected", self.session)),
            ),
            _ => Err(DiscoveryError::CoordinationFatal(format!(
                "session {} expired",
                self.session
            ))),
        }
    }

    /// Drops the connection; the session survives and may reconnect.
    pub fn disconnect(&self) {
        let mut state = self.ensemble.state.lock();
        if matches!(state.sessions.get(&self.session).map(|s| s.state), Some(ClientState::Connected)) {
            state.set_state(self.session, ClientState::Disconnected, Some(SessionState::Disconnected));
        }
    }

    /// Resumes a disconnected session.
    pub fn reconnect(&self) {
        let mut state = self.ensemble.state.lock();
        let current = state.sessions.get(&self.session).map(|s| s.state);
        if state.reachable && matches!(current, Some(ClientState::Pending | ClientState::Disconnected)) {
            state.set_state(self.session, ClientState::Connected, Some(SessionState::SyncConnected));
        }
    }

    /// Ends the session as the server would after a session timeout.
    pub fn expire_session(&self) {
        let mut state = self.ensemble.state.lock();
        debug!("Expiring coordination session {}", self.session);
        state.drop_ephemerals(self.session);
        state.set_state(self.session, ClientState::Expired, Some(SessionState::Expired));
    }

    pub fn ensemble(&self) -> &InMemoryEnsemble {
        &self.ensemble
    }
}

#[async_trait]
impl Coordination for InMemoryCoordination {
    async fn connect(&self, events: UnboundedSender<CoordinationEvent>) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        let reachable = state.reachable;
        let session = state
            .sessions
            .get_mut(&self.session)
            .ok_or_else(|| DiscoveryError::CoordinationFatal("unknown session".to_string()))?;
        if session.state != ClientState::Pending {
            return Err(DiscoveryError::CoordinationFatal(format!(
                "session {} cannot connect twice",
                self.session
            )));
        }
        session.events = Some(events);
        if reachable {
            state.set_state(self.session, ClientState::Connected, Some(SessionState::SyncConnected));
        }
        Ok(())
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Option<Vec<u8>>> {
        let mut state = self.ensemble.state.lock();
        self.check_connected(&state)?;
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session);
        }
        Ok(state.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Option<Vec<String>>> {
        let mut state = self.ensemble.state.lock();
        self.check_connected(&state)?;
        if watch {
            state
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session);
        }
        if !state.nodes.contains_key(path) {
            return Ok(None);
        }
        Ok(Some(state.children_of(path)))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut state = self.ensemble.state.lock();
        self.check_connected(&state)?;
        let (actual, owner) = match mode {
            CreateMode::Persistent => {
                if state.nodes.contains_key(path) {
                    return Err(DiscoveryError::config_inconsistent(path, "node already exists"));
                }
                (path.to_string(), None)
            }
            CreateMode::EphemeralSequential => {
                let parent = parent_of(path).unwrap_or("/").to_string();
                let seq = state.sequences.entry(parent).or_insert(0);
                let actual = format!("{}{:010}", path, *seq);
                *seq += 1;
                (actual, Some(self.session))
            }
        };
        state.insert_node(actual.clone(), data, owner);
        Ok(actual)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        validate_path(path)?;
        let mut state = self.ensemble.state.lock();
        self.check_connected(&state)?;
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                state.fire_data(path);
            }
            None => state.insert_node(path.to_string(), data, None),
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        self.check_connected(&state)?;
        state.remove_node(path);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        state.drop_ephemerals(self.session);
        state.set_state(self.session, ClientState::Closed, None);
        Ok(())
    }

    fn session_id(&self) -> Option<u64> {
        let state = self.ensemble.state.lock();
        match state.sessions.get(&self.session).map(|s| s.state) {
            Some(ClientState::Connected | ClientState::Disconnected) => Some(self.session),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connected(ensemble: &InMemoryEnsemble) -> (InMemoryCoordination, mpsc::UnboundedReceiver<CoordinationEvent>) {
        let client = ensemble.client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::Session(SessionState::SyncConnected))
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_set_and_get_data() {
        let ensemble = InMemoryEnsemble::new();
        let (client, _rx) = connected(&ensemble).await;

        assert_eq!(client.get_data("/a/b", false).await.unwrap(), None);
        client.set_data("/a/b", b"hello".to_vec()).await.unwrap();
        assert_eq!(client.get_data("/a/b", false).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(client.get_children("/a", false).await.unwrap(), Some(vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let ensemble = InMemoryEnsemble::new();
        let (client, mut rx) = connected(&ensemble).await;

        client.get_data("/x", true).await.unwrap();
        ensemble.write("/x", b"1".to_vec());
        ensemble.write("/x", b"2".to_vec());

        assert_eq!(rx.recv().await, Some(CoordinationEvent::NodeDataChanged("/x".to_string())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ephemeral_sequential_names() {
        let ensemble = InMemoryEnsemble::new();
        let (client, _rx) = connected(&ensemble).await;

        let first = client
            .create("/uris/c/ephemeral-", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = client
            .create("/uris/c/ephemeral-", b"b".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/uris/c/ephemeral-0000000000");
        assert_eq!(second, "/uris/c/ephemeral-0000000001");
        assert_eq!(ensemble.children("/uris/c").len(), 2);
    }

    #[tokio::test]
    async fn test_expiry_drops_ephemerals_and_fails_ops() {
        let ensemble = InMemoryEnsemble::new();
        let (owner, mut owner_rx) = connected(&ensemble).await;
        let (observer, mut observer_rx) = connected(&ensemble).await;

        owner
            .create("/uris/c/ephemeral-", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        observer.get_children("/uris/c", true).await.unwrap();

        owner.expire_session();

        assert_eq!(
            owner_rx.recv().await,
            Some(CoordinationEvent::Session(SessionState::Expired))
        );
        assert_eq!(
            observer_rx.recv().await,
            Some(CoordinationEvent::NodeChildrenChanged("/uris/c".to_string()))
        );
        assert!(ensemble.children("/uris/c").is_empty());
        assert!(matches!(
            owner.get_data("/uris", false).await,
            Err(DiscoveryError::CoordinationFatal(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_transient() {
        let ensemble = InMemoryEnsemble::new();
        let (client, mut rx) = connected(&ensemble).await;

        client.disconnect();
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::Session(SessionState::Disconnected))
        );
        assert!(matches!(
            client.get_data("/a", false).await,
            Err(DiscoveryError::CoordinationTransient(_))
        ));

        client.reconnect();
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::Session(SessionState::SyncConnected))
        );
        assert!(client.get_data("/a", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_ensemble_defers_connection() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.set_reachable(false);

        let client = ensemble.client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(ensemble.connected_sessions(), 0);

        ensemble.set_reachable(true);
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::Session(SessionState::SyncConnected))
        );
    }
}
