use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use wayfinder_common::{DiscoveryError, PropertySerializer, Result};

use crate::store::PropertyStore;

/// On-disk store with one file per key.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so a reader never sees a half-written record.
pub struct FileStore<T> {
    dir: PathBuf,
    serializer: Arc<dyn PropertySerializer<T>>,
}

impl<T> FileStore<T> {
    /// Opens (and creates if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, serializer: Arc<dyn PropertySerializer<T>>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, serializer })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

/// Escapes everything outside `[A-Za-z0-9._-]` as `%XX`.
///
/// A leading dot is escaped as well so keys never collide with temp files.
fn file_name_for(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0);
        if plain {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

#[async_trait]
impl<T> PropertyStore<T> for FileStore<T>
where
    T: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<T>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => self.serializer.from_bytes(key, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiscoveryError::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: T) -> Result<()> {
        let bytes = self.serializer.to_bytes(&value)?;
        let dir = self.dir.clone();
        let target = self.path_for(key);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| DiscoveryError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| DiscoveryError::Io(std::io::Error::other(e)))??;

        debug!("Wrote backup record {} to {}", key, self.dir.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiscoveryError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_escaping() {
        assert_eq!(file_name_for("profile-cluster"), "profile-cluster");
        assert_eq!(file_name_for("a/b"), "a%2Fb");
        assert_eq!(file_name_for(".hidden"), "%2Ehidden");
        assert_eq!(file_name_for("v1.2"), "v1.2");
    }
}
