//! Configuration model
//!
//! Holds the merged application configuration and a read-only mirror of the
//! connection state, and fans typed [`ModelEvent`]s out to registered observers.
//! Every mutation goes through [`ConfigurationModel::update_config`], which
//! validates, persists and notifies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthManager, AuthMethod};
use crate::connection::ConnectionState;
use crate::hub::redact;
use crate::store::{keys, Store, StoreError};

/// Application configuration
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub hub_url: String,

    #[serde(default)]
    pub auth_method: Option<AuthMethod>,

    #[serde(default)]
    pub modules_enabled: BTreeMap<String, bool>,

    /// Per-module settings blobs, keyed by module id
    #[serde(default)]
    pub modules: BTreeMap<String, Value>,

    /// Token typed into the settings form. Handed to the auth manager on save,
    /// never persisted as part of the configuration.
    #[serde(default, skip_serializing)]
    pub long_lived_token: Option<String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("hub_url", &self.hub_url)
            .field("auth_method", &self.auth_method)
            .field("modules_enabled", &self.modules_enabled)
            .field("modules", &self.modules)
            .field("long_lived_token", &self.long_lived_token.as_deref().map(redact))
            .finish()
    }
}

impl AppConfig {
    pub fn is_module_enabled(&self, id: &str) -> bool {
        self.modules_enabled.get(id).copied().unwrap_or(false)
    }

    pub fn module_config(&self, id: &str) -> Option<&Value> {
        self.modules.get(id)
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid hub URL {url:?}: {reason}")]
    InvalidHubUrl { url: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normalise and validate a hub URL. Empty stays empty (not configured yet).
pub fn normalize_hub_url(raw: &str) -> Result<String, ModelError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let invalid = |reason: String| ModelError::InvalidHubUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Events delivered to model observers
#[derive(Debug, Clone)]
pub enum ModelEvent {
    ConfigLoaded(AppConfig),
    ConfigChanged(AppConfig),
    ConnectionChanged(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ModelEvent) + Send + Sync>;

pub struct ConfigurationModel {
    store: Store,
    auth: AuthManager,
    config: RwLock<AppConfig>,
    connection: RwLock<ConnectionState>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl ConfigurationModel {
    pub fn new(store: Store, auth: AuthManager) -> Self {
        Self {
            store,
            auth,
            config: RwLock::new(AppConfig::default()),
            connection: RwLock::new(ConnectionState::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Observers
    // =========================================================================

    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        self.observers_mut().push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers_mut();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn clear_observers(&self) {
        self.observers_mut().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers_mut().len()
    }

    fn observers_mut(&self) -> MutexGuard<'_, Vec<(ObserverId, Observer)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: ModelEvent) {
        // Snapshot so observers may (un)register from inside a callback
        let observers: Vec<Observer> = self
            .observers_mut()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer(&event);
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current configuration
    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_config(&self, config: AppConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Build the configuration from storage and announce it
    pub async fn load(&self) -> AppConfig {
        let hub_url = self.store.get(keys::HUB_URL).await.unwrap_or_default();
        let auth_method = self.auth.auth_method().await;
        let modules_enabled = self
            .store
            .get_json::<BTreeMap<String, bool>>(keys::MODULES_ENABLED)
            .await
            .unwrap_or_else(|e| {
                warn!("Ignoring stored module map: {}", e);
                None
            })
            .unwrap_or_default();
        let modules = self
            .store
            .get_json::<BTreeMap<String, Value>>(keys::MODULE_SETTINGS)
            .await
            .unwrap_or_else(|e| {
                warn!("Ignoring stored module settings: {}", e);
                None
            })
            .unwrap_or_default();

        let config = AppConfig {
            hub_url,
            auth_method,
            modules_enabled,
            modules,
            long_lived_token: None,
        };
        debug!("Configuration loaded: {:?}", config);
        self.replace_config(config.clone());
        self.notify(ModelEvent::ConfigLoaded(config.clone()));
        config
    }

    /// Validate, persist and announce a new configuration
    pub async fn update_config(&self, mut config: AppConfig) -> Result<AppConfig, ModelError> {
        config.hub_url = normalize_hub_url(&config.hub_url)?;
        // Secrets go through the auth manager, not the config
        config.long_lived_token = None;

        if config.hub_url.is_empty() {
            self.store.remove(keys::HUB_URL).await?;
        } else {
            self.store.set(keys::HUB_URL, config.hub_url.clone()).await?;
        }
        match config.auth_method {
            Some(method) => self.auth.set_auth_method(method).await?,
            None => self.store.remove(keys::AUTH_METHOD).await?,
        }
        self.store
            .set_json(keys::MODULES_ENABLED, &config.modules_enabled)
            .await?;
        self.store
            .set_json(keys::MODULE_SETTINGS, &config.modules)
            .await?;

        self.replace_config(config.clone());
        self.notify(ModelEvent::ConfigChanged(config.clone()));
        Ok(config)
    }

    /// Hub URL set, auth method chosen, and a credential for that method stored
    pub async fn is_config_complete(&self) -> bool {
        let config = self.config();
        if config.hub_url.trim().is_empty() {
            return false;
        }
        match config.auth_method {
            Some(method) => self.auth.has_credential(method).await,
            None => false,
        }
    }

    // =========================================================================
    // Connection mirror
    // =========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        {
            let mut current = self.connection.write().unwrap_or_else(PoisonError::into_inner);
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        self.notify(ModelEvent::ConnectionChanged(state));
    }
}
