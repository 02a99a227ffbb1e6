//! In-memory store, mostly for embedding hosts and tests.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use super::{BackendStore, PatternMode, StoreBackend, StoreOptions};
use crate::error::{Error, Result};

/// Store keeping content in a concurrent map.
pub type MemoryStore = BackendStore<MemoryBackend>;

struct Entry {
    bytes: Arc<[u8]>,
    modified: u64,
}

/// Path -> bytes map with monotonic modification stamps.
pub struct MemoryBackend {
    name: String,
    entries: DashMap<String, Entry>,
    clock: AtomicU64,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Insert or replace content; the path's timestamp always moves forward.
    pub fn put(&self, path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.max(now).saturating_add(1))
            })
            .unwrap_or(now);
        let stamp = previous.max(now).saturating_add(1);
        self.entries.insert(
            path.into(),
            Entry {
                bytes: bytes.into(),
                modified: stamp,
            },
        );
    }

    pub fn remove(&self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    fn missing(&self, path: &str) -> Error {
        Error::NotFound {
            store: self.name.clone(),
            path: path.to_string(),
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .entries
            .get(path)
            .map(|e| Arc::clone(&e.bytes))
            .ok_or_else(|| self.missing(path))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn last_modified(&self, path: &str) -> Result<u64> {
        self.entries
            .get(path)
            .map(|e| e.modified)
            .ok_or_else(|| self.missing(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }
}

impl MemoryStore {
    /// Empty store with default options.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::with_mode(MemoryBackend::new(name), PatternMode::Exact, StoreOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: StoreOptions) -> Result<Self> {
        Self::new(MemoryBackend::new(name), options)
    }

    pub fn put(&self, path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.backend().put(path, bytes);
    }

    pub fn remove(&self, path: &str) -> bool {
        self.backend().remove(path)
    }
}
