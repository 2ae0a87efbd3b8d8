// Copyright 2025 Wayfinder Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coordination session lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> SyncConnected <-> TransientDisconnected
//!                      ^                |
//!                      +--- Expired <---+
//! ```
//!
//! SyncConnected enables the primary stores (unless the flag file exists),
//! a transient disconnect falls back to the backup stores and keeps all
//! state. Expiry builds a new connection and a new load balancer from
//! scratch, swaps them in once they have data, and retires the old pair
//! after a grace period.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use wayfinder_common::{DiscoveryError, Result, UriProperties};
use wayfinder_metrics::MetricsRegistry;
use wayfinder_store::{Coordination, CoordinationEvent, InMemoryEnsemble, SessionState};

use crate::balancer::LoadBalancer;
use crate::config::SessionConfig;
use crate::control::{ControlCommand, StandingOverrides};
use crate::stores::DiscoveryStores;
use crate::transport::TransportRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    SyncConnected,
    TransientDisconnected,
    Expired,
}

/// Opens fresh connections to the coordination service.
pub trait CoordinationFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Coordination>>;
}

impl CoordinationFactory for InMemoryEnsemble {
    fn create(&self) -> Result<Arc<dyn Coordination>> {
        Ok(Arc::new(self.client()))
    }
}

/// One coordination connection and the load balancer fed by it.
struct Session {
    id: u64,
    coordination: Arc<dyn Coordination>,
    balancer: Arc<LoadBalancer>,
    phase: RwLock<SessionPhase>,
    /// Fired by the first completed store switch
    started: Mutex<Option<oneshot::Sender<()>>>,
    /// Clusters this session has announced endpoints for
    announced: Mutex<BTreeSet<String>>,
    replacing: AtomicBool,
    retired: AtomicBool,
}

impl Session {
    fn set_phase(&self, phase: SessionPhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), phase);
        if previous != phase {
            debug!("Session {} {:?} -> {:?}", self.id, previous, phase);
        }
    }

    fn signal_started(&self) {
        if let Some(started) = self.started.lock().take() {
            let _ = started.send(());
        }
    }
}

struct Inner {
    config: SessionConfig,
    factory: Arc<dyn CoordinationFactory>,
    transports: TransportRegistry,
    metrics: Arc<MetricsRegistry>,
    current: ArcSwapOption<Session>,
    next_id: AtomicU64,
    /// Endpoint sets to keep announced across session expiry
    announcements: Mutex<BTreeMap<String, UriProperties>>,
    /// Operator overrides replayed onto every new load balancer
    controls: Mutex<StandingOverrides>,
    closed: AtomicBool,
}

/// Owns the coordination connection and the load balancer built on it.
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn CoordinationFactory>,
        transports: TransportRegistry,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                transports,
                metrics,
                current: ArcSwapOption::empty(),
                next_id: AtomicU64::new(1),
                announcements: Mutex::new(BTreeMap::new()),
                controls: Mutex::new(StandingOverrides::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connects and waits until the load balancer has a data source.
    ///
    /// Returns once the first store switch completes. If the connection
    /// fails, or does not come up within `initial_connect_timeout`, the
    /// backup stores are enabled and `start` still succeeds.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (session, started, events) = open_session(inner).await?;
        inner.current.store(Some(session.clone()));

        if let Err(e) = session.coordination.connect(events).await {
            warn!("Failed to connect to the coordination service, serving from backup: {}", e);
            session.set_phase(SessionPhase::Disconnected);
            switch_to_backup(inner, &session).await;
            return Ok(());
        }

        let timeout = inner.config.initial_connect_timeout;
        if tokio::time::timeout(timeout, started).await.is_err() {
            warn!(
                "No coordination session within {}ms, serving from backup",
                timeout.as_millis()
            );
            switch_to_backup(inner, &session).await;
        }
        Ok(())
    }

    pub fn phase(&self) -> SessionPhase {
        match self.inner.current.load_full() {
            Some(session) => *session.phase.read(),
            None => SessionPhase::Disconnected,
        }
    }

    /// Load balancer of the current session.
    pub fn balancer(&self) -> Result<Arc<LoadBalancer>> {
        self.inner
            .current
            .load_full()
            .map(|s| s.balancer.clone())
            .ok_or(DiscoveryError::ShutDown)
    }

    pub fn session_id(&self) -> Option<u64> {
        self.inner.current.load_full().and_then(|s| s.coordination.session_id())
    }

    /// Forwards a command to the current load balancer and remembers it for
    /// the ones built after expiry.
    pub fn control(&self, command: ControlCommand) -> Result<()> {
        self.inner.controls.lock().record(&command);
        self.balancer()?.control(command)
    }

    /// Announces `uris` for `cluster` from this client, replacing an earlier
    /// announcement. The announcement is repeated on every new session.
    pub async fn announce(&self, cluster: &str, uris: UriProperties) -> Result<()> {
        self.inner
            .announcements
            .lock()
            .insert(cluster.to_string(), uris.clone());
        let Some(session) = self.inner.current.load_full() else {
            return Err(DiscoveryError::ShutDown);
        };
        let replaced = session.announced.lock().remove(cluster);
        if replaced {
            session.balancer.stores().withdraw(cluster).await?;
        }
        session.balancer.stores().announce(cluster, uris).await?;
        session.announced.lock().insert(cluster.to_string());
        info!("Announced endpoints of cluster {}", cluster);
        Ok(())
    }

    pub async fn withdraw(&self, cluster: &str) -> Result<()> {
        self.inner.announcements.lock().remove(cluster);
        let Some(session) = self.inner.current.load_full() else {
            return Ok(());
        };
        let announced = session.announced.lock().remove(cluster);
        if announced {
            session.balancer.stores().withdraw(cluster).await?;
        }
        Ok(())
    }

    /// Shuts the load balancer down, then closes the connection. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(session) = self.inner.current.swap(None) {
            session.retired.store(true, Ordering::SeqCst);
            session.balancer.shutdown().await?;
            session.coordination.close().await?;
        }
        info!("Session coordinator shut down");
        Ok(())
    }
}

type OpenedSession = (Arc<Session>, oneshot::Receiver<()>, mpsc::UnboundedSender<CoordinationEvent>);

/// Builds a connection and load balancer and starts pumping their events.
/// The caller connects with the returned sender.
async fn open_session(inner: &Arc<Inner>) -> Result<OpenedSession> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let coordination = inner.factory.create()?;
    let stores = DiscoveryStores::new(
        coordination.clone(),
        &inner.config.base_path,
        &inner.config.backup_dir,
    )?;
    let balancer = Arc::new(LoadBalancer::new(
        stores,
        inner.transports.clone(),
        inner.metrics.clone(),
        inner.config.load_balancer.clone(),
    ));
    balancer.start().await?;
    let controls = inner.controls.lock().replay();
    for command in controls {
        balancer.control(command)?;
    }

    let (started_tx, started_rx) = oneshot::channel();
    let session = Arc::new(Session {
        id,
        coordination,
        balancer,
        phase: RwLock::new(SessionPhase::Connecting),
        started: Mutex::new(Some(started_tx)),
        announced: Mutex::new(BTreeSet::new()),
        replacing: AtomicBool::new(false),
        retired: AtomicBool::new(false),
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(Arc::downgrade(inner), session.clone(), events_rx));
    info!("Opened coordination session {}", id);
    Ok((session, started_rx, events_tx))
}

async fn pump(inner: Weak<Inner>, session: Arc<Session>, mut events: mpsc::UnboundedReceiver<CoordinationEvent>) {
    while let Some(event) = events.recv().await {
        if session.retired.load(Ordering::SeqCst) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            CoordinationEvent::Session(state) => on_session_state(&inner, &session, state),
            watch => {
                if !session.balancer.handle_coordination_event(&watch) {
                    debug!("Ignoring unrelated notification {:?}", watch);
                }
            }
        }
    }
    debug!("Event pump of session {} stopped", session.id);
}

fn on_session_state(inner: &Arc<Inner>, session: &Arc<Session>, state: SessionState) {
    match state {
        SessionState::SyncConnected => {
            session.set_phase(SessionPhase::SyncConnected);
            tokio::spawn(on_connected(inner.clone(), session.clone()));
        }
        SessionState::Disconnected => {
            session.set_phase(SessionPhase::TransientDisconnected);
            info!("Session {} disconnected, serving from backup", session.id);
            let (inner, session) = (inner.clone(), session.clone());
            tokio::spawn(async move { switch_to_backup(&inner, &session).await });
        }
        SessionState::Expired => {
            session.set_phase(SessionPhase::Expired);
            if session.replacing.swap(true, Ordering::SeqCst) {
                return;
            }
            tokio::spawn(replace_session(inner.clone(), session.clone()));
        }
    }
}

async fn on_connected(inner: Arc<Inner>, session: Arc<Session>) {
    let flagged = match &inner.config.flag_file {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    };
    if flagged {
        info!("Flag file present, session {} stays on backup", session.id);
        switch_to_backup(&inner, &session).await;
        return;
    }

    match session.balancer.enable_primary().await {
        Ok(()) => {
            inner.metrics.record_store_switch();
            session.signal_started();
            announce_pending(&inner, &session).await;
        }
        Err(DiscoveryError::SwitchCancelled) => debug!("Primary switch of session {} superseded", session.id),
        Err(e) => {
            warn!("Failed to enable primary stores of session {}: {}", session.id, e);
            switch_to_backup(&inner, &session).await;
        }
    }
}

async fn switch_to_backup(inner: &Inner, session: &Session) {
    match session.balancer.enable_backup().await {
        Ok(()) => {
            inner.metrics.record_store_switch();
            session.signal_started();
        }
        Err(DiscoveryError::SwitchCancelled) => debug!("Backup switch of session {} superseded", session.id),
        Err(e) => error!("Failed to enable backup stores of session {}: {}", session.id, e),
    }
}

/// Re-issues announcements this session has not made yet.
async fn announce_pending(inner: &Inner, session: &Session) {
    let pending: Vec<(String, UriProperties)> = {
        let announced = session.announced.lock();
        inner
            .announcements
            .lock()
            .iter()
            .filter(|(cluster, _)| !announced.contains(*cluster))
            .map(|(cluster, uris)| (cluster.clone(), uris.clone()))
            .collect()
    };
    for (cluster, uris) in pending {
        match session.balancer.stores().announce(&cluster, uris).await {
            Ok(()) => {
                session.announced.lock().insert(cluster.clone());
                info!("Re-announced endpoints of cluster {} on session {}", cluster, session.id);
            }
            Err(e) => warn!("Failed to announce endpoints of cluster {}: {}", cluster, e),
        }
    }
}

/// Replaces an expired session with a freshly built one.
async fn replace_session(inner: Arc<Inner>, expired: Arc<Session>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    warn!("Session {} expired, rebuilding the load balancer", expired.id);
    let services = expired.balancer.listened_services();

    let (session, started, events) = match open_session(&inner).await {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to rebuild expired session {}: {}", expired.id, e);
            return;
        }
    };
    for service in &services {
        if let Err(e) = session.balancer.listen_to_service(service) {
            warn!("Failed to listen to {} on session {}: {}", service, session.id, e);
        }
    }

    match session.coordination.connect(events).await {
        Ok(()) => {
            let timeout = inner.config.initial_connect_timeout;
            if tokio::time::timeout(timeout, started).await.is_err() {
                warn!("Session {} did not connect within {}ms", session.id, timeout.as_millis());
                switch_to_backup(&inner, &session).await;
            }
        }
        Err(e) => {
            warn!("Failed to reconnect after expiry, serving from backup: {}", e);
            session.set_phase(SessionPhase::Disconnected);
            switch_to_backup(&inner, &session).await;
        }
    }

    if inner.closed.load(Ordering::SeqCst) {
        let _ = session.balancer.shutdown().await;
        let _ = session.coordination.close().await;
        return;
    }
    inner.current.store(Some(session.clone()));
    expired.retired.store(true, Ordering::SeqCst);
    info!(
        "Session {} replaced expired session {} ({} services)",
        session.id,
        expired.id,
        services.len()
    );

    let delay = inner.config.expired_shutdown_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = expired.balancer.shutdown().await {
            warn!("Failed to shut down load balancer of session {}: {}", expired.id, e);
        }
        let _ = expired.coordination.close().await;
    });
}
