//! Persistent key-value store
//!
//! Holds configuration and credentials as strings under a fixed key prefix.
//! JSON values are serialized to strings before they are stored. A file-backed
//! store keeps every namespaced entry in a single JSON object on disk; entries
//! with other prefixes that live in the same file are preserved untouched.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default namespace prefix for all keys written by this application
pub const DEFAULT_KEY_PREFIX: &str = "pantry_hub_";

/// Well-known keys (without prefix)
pub mod keys {
    pub const HUB_URL: &str = "hub_url";
    pub const AUTH_METHOD: &str = "auth_method";
    pub const MODULE_SETTINGS: &str = "module_settings";
    pub const MODULES_ENABLED: &str = "modules_enabled";
    pub const DELEGATED_TOKENS: &str = "delegated_tokens";
    pub const LONG_LIVED_TOKEN: &str = "long_lived_token";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("value for key {key} is not valid JSON: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Namespaced key-value store
#[derive(Clone)]
pub struct Store {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
    path: Option<PathBuf>,
    prefix: String,
}

impl Store {
    /// Open a file-backed store. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        let path = path.into();
        let entries = Self::load_from_disk(&path);
        debug!("Store opened at {} ({} entries)", path.display(), entries.len());
        Self {
            entries: Arc::new(RwLock::new(entries)),
            path: Some(path),
            prefix: prefix.into(),
        }
    }

    /// Store that lives only in memory (tests, headless runs without a data dir)
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            path: None,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn load_from_disk(path: &Path) -> BTreeMap<String, String> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable store file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    fn save_to_disk(&self, snapshot: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(snapshot).map_err(|source| StoreError::Json {
            key: "<store>".to_string(),
            source,
        })?;

        // Write to a sibling file first so a crash never leaves a truncated store
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Get a raw string value
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(&self.full_key(key)).cloned()
    }

    /// Set a raw string value and persist
    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.write().await;
            entries.insert(self.full_key(key), value.into());
            entries.clone()
        };
        self.save_to_disk(&snapshot)
    }

    /// Remove a key and persist. Removing a missing key is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let snapshot = {
            let mut entries = self.entries.write().await;
            if entries.remove(&self.full_key(key)).is_none() {
                return Ok(());
            }
            entries.clone()
        };
        self.save_to_disk(&snapshot)
    }

    /// Whether a non-empty value exists for `key`
    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_some_and(|v| !v.is_empty())
    }

    /// Get a JSON value. A missing key is `Ok(None)`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Json {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Serialize and store a JSON value
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        self.set(key, raw).await
    }

    /// Keys in this store's namespace (prefix stripped)
    pub async fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect()
    }
}
