//! Per-origin key/value storage shared by every tab, with change events.
//!
//! Mirrors the semantics tabs rely on: writes are visible to all tabs of the
//! origin, and every mutation that changes a value produces a change event
//! that sibling tabs can observe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tabsync_protocol::SyncError;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub trait SharedStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError>;
    fn remove_item(&self, key: &str) -> Result<(), SyncError>;
    /// Change events for every mutation that alters a value.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

const CHANGE_CAPACITY: usize = 256;

/// Items plus the change fan-out, shared by both storage flavours.
struct Items {
    map: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Items {
    fn new(map: HashMap<String, String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            map: RwLock::new(map),
            changes,
        }
    }

    /// Apply a mutation; returns the change if the value actually changed.
    fn apply(&self, key: &str, value: Option<&str>) -> Option<StorageChange> {
        let mut map = self.map.write();
        let old_value = match value {
            Some(v) => map.insert(key.to_string(), v.to_string()),
            None => map.remove(key),
        };
        if old_value.as_deref() == value {
            return None;
        }
        Some(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: value.map(str::to_string),
        })
    }

    fn publish(&self, change: StorageChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

/// In-memory storage for one origin. Clones share the same items, so handing
/// a clone to each tab models tabs of one origin.
#[derive(Clone)]
pub struct MemoryStorage {
    items: Arc<Items>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Items::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.items.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.map.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError> {
        if let Some(change) = self.items.apply(key, Some(value)) {
            self.items.publish(change);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), SyncError> {
        if let Some(change) = self.items.apply(key, None) {
            self.items.publish(change);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.items.changes.subscribe()
    }
}

/// Storage persisted as a single JSON object on disk, so tokens survive a
/// restart of the CLI. Change events are delivered to tabs of this process.
#[derive(Clone)]
pub struct FileStorage {
    path: PathBuf,
    items: Arc<Items>,
}

impl FileStorage {
    /// Open (or create on first write) the storage file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str::<HashMap<String, String>>(&content).unwrap_or_else(|e| {
                    warn!("Ignoring corrupt storage file {}: {e}", path.display());
                    HashMap::new()
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(SyncError::Storage(format!("read {}: {e}", path.display()))),
        };
        debug!("Opened storage {} ({} keys)", path.display(), map.len());
        Ok(Self {
            path,
            items: Arc::new(Items::new(map)),
        })
    }

    /// `<data dir>/tabsync/storage.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tabsync")
            .join("storage.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), SyncError> {
        let json = {
            let map = self.items.map.read();
            serde_json::to_string_pretty(&*map).map_err(|e| SyncError::Storage(e.to_string()))?
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| SyncError::Storage(format!("write {}: {e}", self.path.display())))
    }

    fn mutate(&self, key: &str, value: Option<&str>) -> Result<(), SyncError> {
        if let Some(change) = self.items.apply(key, value) {
            self.persist()?;
            self.items.publish(change);
        }
        Ok(())
    }
}

impl SharedStorage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.map.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.mutate(key, Some(value))
    }

    fn remove_item(&self, key: &str) -> Result<(), SyncError> {
        self.mutate(key, None)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.items.changes.subscribe()
    }
}
