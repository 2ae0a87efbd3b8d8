use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use wayfinder_common::Result;

use crate::store::{ChangeListener, PropertyStore};

/// Process-local store, mostly useful as a stand-in primary in tests.
pub struct MemoryStore<T> {
    values: RwLock<HashMap<String, T>>,
    listener: RwLock<Option<ChangeListener>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
        }
    }

    fn notify(&self, key: &str) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(key);
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> PropertyStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: T) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        self.notify(key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let removed = self.values.write().remove(key).is_some();
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    fn set_change_listener(&self, listener: Option<ChangeListener>) {
        *self.listener.write() = listener;
    }
}
