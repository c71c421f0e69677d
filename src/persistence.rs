use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::Mutex;

/// Byte-blob storage keyed by name, the only substrate the pipeline needs to reload
/// state across restarts. A single process hosts both named blobs this crate writes
/// (`esi-cache.json`, `rate-limits.json`); callers provide whatever substrate fits
/// their app (filesystem, a settings table, IndexedDB on the other side of an FFI
/// boundary) by implementing this trait.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, name: &str) -> Option<Vec<u8>>;
    async fn save(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()>;
}

/// Filesystem-backed store. Writes go through a temp file in the same directory
/// followed by a rename, so a crash mid-write never leaves a corrupt blob in place.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, name: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.dir.join(name)).await.ok()
    }

    async fn save(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.flush()?;
            tmp.persist(dir.join(&name))?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// In-memory store for tests and for embedders that don't need state to outlive the
/// process.
#[derive(Default)]
pub struct InMemoryStateStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().await.get(name).cloned()
    }

    async fn save(&self, name: &str, data: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.lock().await.insert(name.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_through_a_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("missing.json").await.is_none());

        store.save("state.json", b"{\"a\":1}".to_vec()).await.unwrap();
        let loaded = store.load("state.json").await.unwrap();
        assert_eq!(loaded, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryStateStore::new();
        store.save("x", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.load("x").await, Some(vec![1, 2, 3]));
    }
}
