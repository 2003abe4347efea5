//! Persisted Key-Value Store
//!
//! Small device-local state that must survive restarts: the auth token, the
//! cached user record and the list of soft-deleted conversations.
//!
//! The file backend keeps every key in one JSON object under
//! `$XDG_DATA_HOME/parley/state.json` and rewrites it through a temporary
//! file on each change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::PersistError;

/// Key for the bearer token
pub const AUTH_TOKEN_KEY: &str = "auth_token";
/// Key for the cached user record
pub const CACHED_USER_KEY: &str = "cached_user";
/// Key for the soft-deleted conversation id list
pub const SOFT_DELETED_KEY: &str = "soft_deleted_conversations";

/// Async key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError>;

    /// Write a value
    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError>;

    /// Delete a value
    async fn remove(&self, key: &str) -> Result<(), PersistError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Volatile store, for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: parking_lot::Mutex<HashMap<String, Value>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// JSON file store
///
/// The whole file is loaded lazily on first access and kept in memory; the
/// async mutex serialises writers so concurrent `set`s cannot interleave.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    values: Mutex<Option<HashMap<String, Value>>>,
}

impl FileKeyValueStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: Mutex::new(None),
        }
    }

    /// Default location: `$XDG_DATA_HOME/parley/state.json`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("parley").join("state.json"))
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, Value>, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PersistError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(PersistError::Io(format!("{}: {e}", self.path.display()))),
        }
    }

    async fn write(&self, values: &HashMap<String, Value>) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::Io(format!("{}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(values)
            .map_err(|e| PersistError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| PersistError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistError::Io(format!("{}: {e}", self.path.display())))
    }

    /// Run `f` against the loaded map, writing back when it reports a change
    async fn with_values<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Value>) -> (T, bool) + Send,
    ) -> Result<T, PersistError> {
        let mut guard = self.values.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let Some(values) = guard.as_mut() else {
            return Err(PersistError::Io("state not loaded".to_string()));
        };

        let (result, changed) = f(values);
        if changed {
            self.write(values).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        self.with_values(|values| (values.get(key).cloned(), false))
            .await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistError> {
        let key = key.to_string();
        self.with_values(move |values| {
            let changed = values.get(&key) != Some(&value);
            values.insert(key, value);
            ((), changed)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.with_values(|values| ((), values.remove(key).is_some()))
            .await
    }
}

// ============================================================================
// Typed accessors
// ============================================================================

/// Typed view over a [`KeyValueStore`]
#[derive(Clone)]
pub struct PersistedState {
    store: Arc<dyn KeyValueStore>,
}

impl PersistedState {
    /// Wrap a store
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Volatile state backed by memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    /// Stored bearer token
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be read.
    pub async fn auth_token(&self) -> Result<Option<String>, PersistError> {
        Ok(self
            .store
            .get(AUTH_TOKEN_KEY)
            .await?
            .and_then(|v| v.as_str().map(String::from)))
    }

    /// Store or clear the bearer token
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be written.
    pub async fn set_auth_token(&self, token: Option<&str>) -> Result<(), PersistError> {
        match token {
            Some(token) => self.store.set(AUTH_TOKEN_KEY, Value::from(token)).await,
            None => self.store.remove(AUTH_TOKEN_KEY).await,
        }
    }

    /// Cached user record
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be read.
    pub async fn cached_user(&self) -> Result<Option<Value>, PersistError> {
        self.store.get(CACHED_USER_KEY).await
    }

    /// Store or clear the cached user record
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be written.
    pub async fn set_cached_user(&self, user: Option<Value>) -> Result<(), PersistError> {
        match user {
            Some(user) => self.store.set(CACHED_USER_KEY, user).await,
            None => self.store.remove(CACHED_USER_KEY).await,
        }
    }

    /// Soft-deleted conversation ids
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be read or the value is malformed.
    pub async fn soft_deleted_conversations(&self) -> Result<Vec<String>, PersistError> {
        match self.store.get(SOFT_DELETED_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| PersistError::Serialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the soft-deleted conversation id list
    ///
    /// # Errors
    ///
    /// Fails if the backing store cannot be written.
    pub async fn set_soft_deleted_conversations(&self, ids: &[String]) -> Result<(), PersistError> {
        let value = serde_json::to_value(ids).map_err(|e| PersistError::Serialization(e.to_string()))?;
        self.store.set(SOFT_DELETED_KEY, value).await
    }
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState").finish_non_exhaustive()
    }
}
