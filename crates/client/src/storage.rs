//! Key/value storage for client identity and ACKed cursors.
//!
//! The base client id and the per-topic cursors live here so a process
//! restart (same storage file) keeps its identity, and a reconnect
//! resumes from the last ACKed cursor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Minimal string key/value storage.
pub trait KvStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory storage; identity and cursors die with the process.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }
}

/// JSON-file-backed storage. The whole map rewrites on every `set`;
/// the value set is tiny (an id plus one cursor per topic).
pub struct FileStorage {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let map = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_owned(),
            map: Mutex::new(map),
        })
    }

    fn flush(&self, map: &HashMap<String, String>) {
        match serde_json::to_string_pretty(map) {
            Ok(json) => {
                if let Err(error) = std::fs::write(&self.path, json) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %error,
                        "failed to persist client storage"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to serialize client storage");
            }
        }
    }
}

impl KvStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.map.lock();
        map.insert(key.to_owned(), value.to_owned());
        self.flush(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.map.lock();
        map.remove(key);
        self.flush(&map);
    }
}
