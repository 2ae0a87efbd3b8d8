use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

use crate::error::{DiscoveryError, Result};
use crate::properties::PropertyRecord;

/// Converts records to and from their stored bytes.
pub trait PropertySerializer<T>: Send + Sync {
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>>;

    /// Decodes and validates the record stored under `key`.
    fn from_bytes(&self, key: &str, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding of property records.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PropertySerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + PropertyRecord,
{
    fn to_bytes(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn from_bytes(&self, key: &str, bytes: &[u8]) -> Result<T> {
        let value: T = serde_json::from_slice(bytes)
            .map_err(|e| DiscoveryError::config_inconsistent(key, e.to_string()))?;
        value.validate()?;
        if value.key() != key {
            return Err(DiscoveryError::config_inconsistent(
                key,
                format!("record names '{}'", value.key()),
            ));
        }
        Ok(value)
    }
}
