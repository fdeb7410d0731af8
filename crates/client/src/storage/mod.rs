//! Key-value persistence for credentials, cookies and the client id.
//!
//! Values are opaque strings (JSON in practice). Two implementations:
//! - [`SqliteStore`]: a single `kv` table in `<data_dir>/ichibot.db`
//! - [`MemoryStore`]: a map behind a mutex, for tests and throwaway sessions

mod database;

use std::collections::BTreeMap;
use std::sync::Mutex;

use protocol::ProtocolError;
use thiserror::Error;

pub use database::SqliteStore;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Path error.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    /// File-backed store I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("Malformed stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for ProtocolError {
    fn from(err: StorageError) -> Self {
        ProtocolError::Storage(err.to_string())
    }
}

/// String key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Entries whose key starts with `prefix` and that satisfy `predicate`,
    /// in key order.
    fn filter(
        &self,
        prefix: &str,
        predicate: &dyn Fn(&str, &str) -> bool,
    ) -> StorageResult<Vec<(String, String)>>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn filter(
        &self,
        prefix: &str,
        predicate: &dyn Fn(&str, &str) -> bool,
    ) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .entries()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
