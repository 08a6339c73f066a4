//! Persistent key/value settings and the bounded protocol log.
//!
//! The session treats storage as an injected capability: anything that
//! implements [`SettingsStore`] can hold connection settings, the driver id
//! and the protocol log. [`FileStore`] persists to
//! `<data_dir>/store.json`; [`MemoryStore`] keeps everything in memory.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use protocol::codec::redact_log_entry;
use serde::{Deserialize, Serialize};

/// Maximum number of protocol log entries kept; oldest are evicted first.
pub const LOG_CAPACITY: usize = 1000;

/// Store key for the persisted driver id.
pub const UUID_KEY: &str = "uuid";

/// Store key for the last device manager message version seen.
pub const VERSION_KEY: &str = "dmmsgversion";

/// String-keyed settings storage with an append-only bounded log.
pub trait SettingsStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`.
    fn clear(&self, key: &str) -> Result<()>;

    /// Removes every saved setting and the log.
    fn clear_all(&self) -> Result<()>;

    /// Appends a JSON message to the log after redaction.
    ///
    /// Messages that are not valid JSON are rejected.
    fn log(&self, message: &str) -> Result<()>;

    /// Returns all log entries, oldest first.
    fn log_entries(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    values: BTreeMap<String, String>,
    log: VecDeque<String>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: 1,
            values: BTreeMap::new(),
            log: VecDeque::new(),
        }
    }
}

impl StoreData {
    fn append_log(&mut self, message: &str) -> Result<()> {
        let entry = redact_log_entry(message)
            .ok_or_else(|| anyhow::anyhow!("Log entries must be JSON"))?;
        while self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(entry);
        Ok(())
    }
}

/// In-memory store, used in tests and by embedders without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("Failed to acquire lock on settings store")
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.values.remove(key);
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        *data = StoreData::default();
        Ok(())
    }

    fn log(&self, message: &str) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.append_log(message)
    }

    fn log_entries(&self) -> Result<Vec<String>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.log.iter().cloned().collect())
    }
}

/// JSON-file backed store.
///
/// Every mutation is written through with an atomic temp-file rename.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileStore {
    /// File name used inside the data directory.
    pub const FILE_NAME: &'static str = "store.json";

    /// Opens (or starts) the store at `<data_dir>/store.json`.
    pub fn open_in<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Self::open(data_dir.as_ref().join(Self::FILE_NAME))
    }

    /// Opens the store at `path`, loading it if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings store: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings store: {}", path.display()))?
        } else {
            tracing::debug!("Settings store not found at {:?}, starting empty", path);
            StoreData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let contents =
            serde_json::to_string_pretty(data).context("Failed to serialize settings store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)
            .with_context(|| format!("Failed to write temp store: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreData) -> Result<()>,
    {
        let mut data = self.data.write().map_err(poisoned)?;
        f(&mut data)?;
        self.save(&data)
    }
}

impl SettingsStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|data| {
            data.values.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.mutate(|data| {
            data.values.remove(key);
            Ok(())
        })
    }

    fn clear_all(&self) -> Result<()> {
        self.mutate(|data| {
            *data = StoreData::default();
            Ok(())
        })
    }

    fn log(&self, message: &str) -> Result<()> {
        self.mutate(|data| data.append_log(message))
    }

    fn log_entries(&self) -> Result<Vec<String>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.log.iter().cloned().collect())
    }
}
