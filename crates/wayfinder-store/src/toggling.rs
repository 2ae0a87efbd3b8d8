use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use wayfinder_common::{DiscoveryError, Result};

use crate::bus::{PropertyEventBus, Subscriber, SubscriptionId};
use crate::store::{ChangeListener, PropertyStore};

/// Which of the two stores feeds the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStore {
    Primary,
    Backup,
}

struct Inner<T> {
    name: String,
    primary: Arc<dyn PropertyStore<T>>,
    backup: Arc<dyn PropertyStore<T>>,
    bus: Arc<PropertyEventBus<T>>,
    active: RwLock<ActiveStore>,
    /// Bumped by every switch; a switch that sees a newer value was superseded
    generation: AtomicU64,
    shut_down: AtomicBool,
    /// Serializes the check-then-publish step of switches and refreshes
    publish: Mutex<()>,
}

/// Primary/backup pair feeding one property bus.
///
/// Exactly one store is active at a time. Values read from the primary are
/// written through to the backup, so the backup always holds the last data
/// set seen from the coordination service.
pub struct TogglingStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TogglingStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TogglingStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates the pair with the backup active.
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn PropertyStore<T>>,
        backup: Arc<dyn PropertyStore<T>>,
        bus: Arc<PropertyEventBus<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                primary,
                backup,
                bus,
                active: RwLock::new(ActiveStore::Backup),
                generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                publish: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn active(&self) -> ActiveStore {
        *self.inner.active.read()
    }

    pub fn bus(&self) -> &Arc<PropertyEventBus<T>> {
        &self.inner.bus
    }

    /// Hooks the primary's change notifications up to this store.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<()> {
        let handle = Handle::current();
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let listener: ChangeListener = Arc::new(move |key: &str| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let key = key.to_string();
            handle.spawn(async move {
                refresh(&inner, &key, Some(ActiveStore::Primary)).await;
            });
        });
        self.inner.primary.set_change_listener(Some(listener));
        debug!("Started {} store", self.inner.name);
        Ok(())
    }

    /// Stops all further publishing. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.primary.set_change_listener(None);
        info!("Shut down {} store", self.inner.name);
        Ok(())
    }

    /// Subscribes to `key`, fetching it from the active store on first use.
    pub fn listen(&self, key: &str, subscriber: Subscriber<T>) -> SubscriptionId {
        let (id, first) = self.inner.bus.subscribe(key, subscriber);
        if first {
            let inner = self.inner.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                refresh(&inner, &key, None).await;
            });
        }
        id
    }

    pub fn unlisten(&self, key: &str, id: SubscriptionId) {
        self.inner.bus.unsubscribe(key, id);
    }

    /// Re-reads `key` from the active store and publishes it.
    pub async fn refresh(&self, key: &str) {
        refresh(&self.inner, key, None).await;
    }

    pub async fn enable_primary(&self) -> Result<()> {
        self.switch_to(ActiveStore::Primary).await
    }

    pub async fn enable_backup(&self) -> Result<()> {
        self.switch_to(ActiveStore::Backup).await
    }

    /// Makes `target` active and re-publishes every subscribed key from it.
    ///
    /// Fails with `SwitchCancelled` if another switch started meanwhile, and
    /// with the store's error if the primary could not be read.
    async fn switch_to(&self, target: ActiveStore) -> Result<()> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShutDown);
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.active.write() = target;

        let keys = inner.bus.subscribed_keys();
        let store = store_for(inner, target);
        let fetched = join_all(keys.iter().map(|key| store.get(key))).await;

        let mut written_through = Vec::new();
        {
            let _publish = inner.publish.lock();
            if inner.generation.load(Ordering::SeqCst) != generation {
                debug!("{} switch to {:?} superseded", inner.name, target);
                return Err(DiscoveryError::SwitchCancelled);
            }
            for (key, result) in keys.iter().zip(fetched) {
                match result {
                    Ok(value) => {
                        if inner.bus.publish(key, value.clone()) && target == ActiveStore::Primary {
                            written_through.push((key.clone(), value));
                        }
                    }
                    Err(e) if e.is_coordination_failure() => return Err(e),
                    Err(e) => warn!("{} store kept previous value of {}: {}", inner.name, key, e),
                }
            }
        }

        for (key, value) in written_through {
            write_through(inner, &key, value).await;
        }
        info!("{} store switched to {:?}", inner.name, target);
        Ok(())
    }
}

fn store_for<T>(inner: &Inner<T>, which: ActiveStore) -> Arc<dyn PropertyStore<T>> {
    match which {
        ActiveStore::Primary => inner.primary.clone(),
        ActiveStore::Backup => inner.backup.clone(),
    }
}

/// Fetches `key` from the active store and publishes it.
///
/// With `only_from` set, nothing happens unless that store is active.
async fn refresh<T>(inner: &Inner<T>, key: &str, only_from: Option<ActiveStore>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    if inner.shut_down.load(Ordering::SeqCst) {
        return;
    }
    let source = *inner.active.read();
    if only_from.is_some_and(|only| only != source) {
        return;
    }

    let result = store_for(inner, source).get(key).await;
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            warn!("{} store failed to read {} from {:?}: {}", inner.name, key, source, e);
            return;
        }
    };

    let changed = {
        let _publish = inner.publish.lock();
        if inner.shut_down.load(Ordering::SeqCst) || *inner.active.read() != source {
            return;
        }
        inner.bus.publish(key, value.clone())
    };

    if changed && source == ActiveStore::Primary {
        write_through(inner, key, value).await;
    }
}

async fn write_through<T>(inner: &Inner<T>, key: &str, value: Option<T>)
where
    T: Send + Sync + 'static,
{
    let result = match value {
        Some(value) => inner.backup.put(key, value).await,
        None => inner.backup.remove(key).await,
    };
    if let Err(e) = result {
        warn!("{} store failed to back up {}: {}", inner.name, key, e);
    }
}
