use async_trait::async_trait;
use std::sync::Arc;
use wayfinder_common::Result;

/// Callback invoked with the key of a record that changed behind the store's back.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Keyed store of property records.
///
/// `get` returns `Ok(None)` for a key that is known to be absent. Errors mean
/// the store could not answer, and callers keep whatever they had before.
#[async_trait]
pub trait PropertyStore<T>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<T>>;

    async fn put(&self, key: &str, value: T) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Registers the callback fired when a previously fetched key changes.
    ///
    /// Stores that only change through their own `put`/`remove` may ignore it.
    fn set_change_listener(&self, _listener: Option<ChangeListener>) {}
}
