use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DeskError;

/// Per-origin budget browsers give local storage.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Synchronous string-keyed store. Implementations know nothing about
/// principals or records and never retry a failed write.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> crate::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> crate::Result<()>;
    fn remove(&self, key: &str) -> crate::Result<()>;
    /// Order is unspecified.
    fn keys(&self) -> crate::Result<Vec<String>>;
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct StorageInner {
    entries: HashMap<String, String>,
}

impl StorageInner {
    /// Total bytes held if `key` were set to `value`.
    fn size_with(&self, key: &str, value: &str) -> usize {
        let others: usize = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        others + key.len() + value.len()
    }

    fn size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

static GLOBAL_STORAGE: Lazy<RwLock<StorageInner>> = Lazy::new(|| {
    let path = Storage::persistence_file();
    let inner = match Storage::load_file(&path) {
        Ok(loaded) => loaded.unwrap_or_default(),
        Err(e) => {
            warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            StorageInner::default()
        }
    };
    RwLock::new(inner)
});

#[derive(Clone)]
pub struct Storage {
    // None routes every operation to the process-wide store, which persists to the
    // platform data directory. Some(..) is an isolated store that persists only when
    // `persistence_path` is set.
    inner: Option<Arc<RwLock<StorageInner>>>,
    persistence_path: Option<PathBuf>,
    quota_bytes: Option<usize>,
}

impl Storage {
    pub fn new() -> crate::Result<Self> {
        Ok(Self {
            inner: None,
            persistence_path: None,
            quota_bytes: None,
        })
    }

    /// Isolated store that lives only as long as its handles.
    pub fn in_memory() -> Self {
        Self {
            inner: Some(Arc::new(RwLock::new(StorageInner::default()))),
            persistence_path: None,
            quota_bytes: None,
        }
    }

    // `with_path` creates an isolated store backed by a JSON file. An existing file is
    // loaded; a corrupt one is treated as empty. Every mutation rewrites the file.
    pub fn with_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let pb = path.as_ref().to_path_buf();
        let loaded = match Self::load_file(&pb) {
            Ok(loaded) => loaded.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", pb.display(), e);
                StorageInner::default()
            }
        };

        Ok(Self {
            inner: Some(Arc::new(RwLock::new(loaded))),
            persistence_path: Some(pb),
            quota_bytes: None,
        })
    }

    /// Caps the total size of keys plus values, in bytes.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn quota_bytes(&self) -> Option<usize> {
        self.quota_bytes
    }

    pub fn len(&self) -> crate::Result<usize> {
        self.with_read(|guard| guard.entries.len())
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes currently held, counted the same way the quota counts them.
    pub fn used_bytes(&self) -> crate::Result<usize> {
        self.with_read(|guard| guard.size())
    }

    fn lock_for(&self) -> &RwLock<StorageInner> {
        match &self.inner {
            Some(inner) => inner.as_ref(),
            None => Lazy::force(&GLOBAL_STORAGE),
        }
    }

    fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&StorageInner) -> R,
    {
        let guard = self
            .lock_for()
            .read()
            .map_err(|e| DeskError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    // Mutates under the write lock and persists before releasing it, so file
    // writes land in the same order as the in-memory mutations.
    fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut StorageInner) -> crate::Result<(R, bool)>,
    {
        let mut guard = self
            .lock_for()
            .write()
            .map_err(|e| DeskError::Storage(e.to_string()))?;
        let (result, changed) = f(&mut guard)?;
        if changed {
            if let Some(path) = self.target_path() {
                Self::save_to_path(&path, &guard)?;
            }
        }
        Ok(result)
    }

    fn target_path(&self) -> Option<PathBuf> {
        match (&self.persistence_path, &self.inner) {
            (Some(path), _) => Some(path.clone()),
            (None, None) => Some(Self::persistence_file()),
            (None, Some(_)) => None,
        }
    }

    /// Explicitly rewrites the backing file, if there is one.
    pub fn flush(&self) -> crate::Result<()> {
        match self.target_path() {
            Some(path) => {
                let snapshot = self.with_read(|guard| guard.clone())?;
                Self::save_to_path(&path, &snapshot)
            }
            None => Ok(()),
        }
    }
}

impl KeyValueStore for Storage {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        self.with_read(|guard| guard.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        let quota = self.quota_bytes;
        self.with_write(|guard| {
            if let Some(limit) = quota {
                let required = guard.size_with(key, value);
                if required > limit {
                    return Err(DeskError::QuotaExceeded {
                        key: key.to_string(),
                        required,
                        limit,
                    });
                }
            }
            guard.entries.insert(key.to_string(), value.to_string());
            Ok(((), true))
        })
    }

    fn remove(&self, key: &str) -> crate::Result<()> {
        self.with_write(|guard| {
            let removed = guard.entries.remove(key).is_some();
            Ok(((), removed))
        })
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        self.with_read(|guard| guard.entries.keys().cloned().collect())
    }
}

/// Reads and parses a JSON value. Missing keys, adapter errors and corrupt
/// values all come back as `None`; the latter two are logged.
pub(crate) fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read {}: {}", key, e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed value stored under {}: {}", key, e);
            None
        }
    }
}

impl Storage {
    fn data_dir() -> PathBuf {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("research-desk")
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("Library/Application Support/research-desk")
        } else {
            // Linux and others
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".local/share/research-desk")
        }
    }

    pub fn persistence_file() -> PathBuf {
        Self::data_dir().join("state.json")
    }

    fn load_file(path: &Path) -> crate::Result<Option<StorageInner>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        let inner: StorageInner = serde_json::from_str(&data)?;
        debug!("Loaded {} entries from {}", inner.entries.len(), path.display());
        Ok(Some(inner))
    }

    fn save_to_path(path: &Path, inner: &StorageInner) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(inner)?;
        Self::atomic_write(path, data.as_bytes())
    }

    // Writes to a temporary sibling file and renames it into place so an
    // interrupted write never leaves a truncated state file behind.
    fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
        use rand::{thread_rng, Rng};

        let parent = path
            .parent()
            .ok_or_else(|| DeskError::FileSystem("Invalid path".to_string()))?;
        let suffix: u64 = thread_rng().gen();
        let tmp = parent
            .join(".tmp_research_desk")
            .with_extension(format!("{}.tmp", suffix));

        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
