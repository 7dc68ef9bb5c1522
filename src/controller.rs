//! Controller - composition root
//!
//! Wires the store, auth manager, configuration model, connection service and
//! module registry together and owns the application lifecycle:
//!
//! - `initialize()`: load configuration, finish a pending OAuth callback,
//!   enable configured modules, connect when the configuration is complete
//! - `ConfigSaved` on the bus: persist, re-apply module states, reconnect
//! - `destroy()`: stop listeners, drop observers, disable modules, disconnect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::{AuthManager, AuthMethod};
use crate::bus::{create_bus, BusEvent, NotificationLevel, SharedBus};
use crate::config::Settings;
use crate::connection::{ConnectionService, ConnectionSettings, RetryPolicy, DEFAULT_WATCHDOG};
use crate::hub::oauth::{decode_state, CALLBACK_FLAG};
use crate::hub::Hub;
use crate::model::{AppConfig, ConfigurationModel, ModelEvent, ObserverId};
use crate::modules::scale::ScaleFactory;
use crate::modules::scanner::ScannerFactory;
use crate::modules::{ModuleContext, ModuleRegistry};
use crate::store::Store;
use crate::surface::SharedSurface;

/// Query parameters consumed by the OAuth callback
const CALLBACK_PARAMS: &[&str] = &[CALLBACK_FLAG, "code", "state"];

/// Everything the controller needs from the process
pub struct ControllerOptions {
    pub hub: Arc<dyn Hub>,
    pub store: Store,
    pub surface: SharedSurface,
    pub client_id: String,
    pub redirect_uri: String,
    pub retry: RetryPolicy,
    pub watchdog: Duration,
    /// Hub URL to seed when none is stored
    pub initial_hub_url: Option<String>,
}

impl ControllerOptions {
    pub fn new(hub: Arc<dyn Hub>, store: Store, surface: SharedSurface) -> Self {
        Self {
            hub,
            store,
            surface,
            client_id: "http://localhost:8765/".to_string(),
            redirect_uri: "http://localhost:8765/?auth_callback=1".to_string(),
            retry: RetryPolicy::default(),
            watchdog: DEFAULT_WATCHDOG,
            initial_hub_url: None,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        hub: Arc<dyn Hub>,
        store: Store,
        surface: SharedSurface,
    ) -> Self {
        Self {
            client_id: settings.oauth.client_id.clone(),
            redirect_uri: settings.oauth.redirect_uri.clone(),
            retry: settings.connection.retry_policy(),
            watchdog: settings.connection.watchdog(),
            initial_hub_url: settings.hub_url.clone(),
            ..Self::new(hub, store, surface)
        }
    }
}

/// Remove the OAuth callback parameters, keeping everything else
pub fn strip_callback_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !CALLBACK_PARAMS.contains(&&**k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut cleaned = url.clone();
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(kept);
    }
    cleaned
}

fn is_auth_callback(url: &Url) -> bool {
    url.query_pairs()
        .any(|(k, v)| k == CALLBACK_FLAG && (v == "1" || v == "true"))
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    auth: AuthManager,
    bus: SharedBus,
    model: Arc<ConfigurationModel>,
    connection: ConnectionService,
    registry: ModuleRegistry,
    initial_hub_url: Option<String>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    observer: Mutex<Option<ObserverId>>,
    initialized: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Controller {
    pub fn new(options: ControllerOptions) -> Self {
        let bus = create_bus();
        let auth = AuthManager::new(
            options.store.clone(),
            options.hub.clone(),
            options.client_id,
            options.redirect_uri,
        );
        let model = Arc::new(ConfigurationModel::new(options.store, auth.clone()));
        let connection =
            ConnectionService::new(options.hub, auth.clone(), bus.clone(), options.retry)
                .with_watchdog(options.watchdog);
        let registry = ModuleRegistry::new(ModuleContext {
            bus: bus.clone(),
            connection: connection.clone(),
            model: model.clone(),
            surface: options.surface,
        });

        Self {
            inner: Arc::new(Inner {
                auth,
                bus,
                model,
                connection,
                registry,
                initial_hub_url: options.initial_hub_url,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                observer: Mutex::new(None),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.inner.bus
    }

    pub fn model(&self) -> &Arc<ConfigurationModel> {
        &self.inner.model
    }

    pub fn connection(&self) -> &ConnectionService {
        &self.inner.connection
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub fn auth(&self) -> &AuthManager {
        &self.inner.auth
    }

    /// Boot the integration.
    ///
    /// `callback_url` is the page URL when it may carry an OAuth callback;
    /// the cleaned URL is returned when one was consumed. Calling this twice
    /// is a no-op.
    pub async fn initialize(&self, callback_url: Option<&Url>) -> Result<Option<Url>> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Controller already initialized");
            return Ok(None);
        }
        info!("Initializing pantry hub bridge");

        let registry = &self.inner.registry;
        registry
            .register_module(crate::modules::scale::MODULE_ID, Arc::new(ScaleFactory))
            .await?;
        registry
            .register_module(crate::modules::scanner::MODULE_ID, Arc::new(ScannerFactory))
            .await?;

        let observer = self.inner.model.observe(|event| match event {
            ModelEvent::ConfigLoaded(config) | ModelEvent::ConfigChanged(config) => {
                debug!(
                    "Configuration now {:?} with modules {:?}",
                    config.hub_url, config.modules_enabled
                );
            }
            ModelEvent::ConnectionChanged(state) => {
                debug!("Connection mirror: {}", state.status);
            }
        });
        *lock(&self.inner.observer) = Some(observer);

        // Listeners first so nothing published during boot is missed
        self.spawn_bus_listener();
        self.spawn_state_mirror();

        let mut config = self.inner.model.load().await;
        if config.hub_url.is_empty() {
            if let Some(seed) = self.inner.initial_hub_url.clone() {
                info!("Seeding hub URL {}", seed);
                config.hub_url = seed;
                config = self.inner.model.update_config(config).await?;
            }
        }

        let cleaned = match callback_url {
            Some(url) if is_auth_callback(url) => {
                let cleaned = strip_callback_params(url);
                match self.handle_auth_callback(url, &config).await {
                    Ok(updated) => config = updated,
                    Err(e) => {
                        error!("Authorization callback failed: {:#}", e);
                        self.inner.bus.publish(BusEvent::notify(
                            NotificationLevel::Error,
                            "Hub authorization failed; please try again",
                        ));
                    }
                }
                Some(cleaned)
            }
            _ => None,
        };

        self.apply_modules(&config).await;
        self.connect_if_complete(&config).await;
        info!("Pantry hub bridge initialized");
        Ok(cleaned)
    }

    /// Exchange the callback's code for tokens and record delegated auth.
    /// Returns the configuration after the update.
    async fn handle_auth_callback(&self, url: &Url, config: &AppConfig) -> Result<AppConfig> {
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let code = param("code").ok_or_else(|| anyhow!("callback carries no code"))?;
        let hub_url = param("state")
            .and_then(|s| decode_state(&s))
            .map(|s| s.hub_url)
            .filter(|u| !u.is_empty())
            .or_else(|| (!config.hub_url.is_empty()).then(|| config.hub_url.clone()))
            .ok_or_else(|| anyhow!("no hub URL for the authorization callback"))?;

        self.inner
            .auth
            .exchange_auth_code(&hub_url, &code)
            .await
            .context("exchanging authorization code")?;

        let mut updated = config.clone();
        updated.hub_url = hub_url;
        updated.auth_method = Some(AuthMethod::Delegated);
        let updated = self.inner.model.update_config(updated).await?;
        info!("Delegated authorization complete for {}", updated.hub_url);
        self.inner.bus.publish(BusEvent::notify(
            NotificationLevel::Success,
            "Connected your hub account",
        ));
        Ok(updated)
    }

    /// Persist a configuration from the settings form and re-apply it
    pub async fn apply_config(&self, mut config: AppConfig) -> Result<AppConfig> {
        let token = config.long_lived_token.take().filter(|t| !t.trim().is_empty());
        let saved = self.inner.model.update_config(config).await?;

        if let Some(token) = token {
            self.inner
                .auth
                .create_static_auth(&saved.hub_url, &token)
                .await
                .context("storing long-lived token")?;
        }

        self.inner.connection.disconnect();
        self.apply_modules(&saved).await;
        self.connect_if_complete(&saved).await;
        self.inner.bus.publish(BusEvent::notify(
            NotificationLevel::Success,
            "Settings saved",
        ));
        Ok(saved)
    }

    async fn apply_modules(&self, config: &AppConfig) {
        let registry = &self.inner.registry;
        if let Err(e) = registry.update_module_states(&config.modules_enabled).await {
            warn!("Module update incomplete: {}", e);
            self.inner.bus.publish(BusEvent::notify(
                NotificationLevel::Warning,
                format!("A module could not be enabled: {}", e),
            ));
        }
        if let Err(e) = registry.load_module_configs(config).await {
            warn!("Module settings not applied: {}", e);
        }
    }

    async fn connect_if_complete(&self, config: &AppConfig) -> bool {
        let connection = &self.inner.connection;
        connection.configure(ConnectionSettings {
            hub_url: config.hub_url.clone(),
            auth_method: config.auth_method,
        });
        if !self.inner.model.is_config_complete().await {
            info!("Configuration incomplete; not connecting");
            return false;
        }
        connection.connect().await
    }

    /// Forget every stored credential and drop the connection
    pub async fn clear_auth(&self) -> Result<()> {
        self.inner.connection.disconnect();
        self.inner.auth.clear_all_auth().await?;
        Ok(())
    }

    fn spawn_bus_listener(&self) {
        let controller = self.clone();
        let cancel = self.inner.cancel.clone();
        let mut events = self.inner.bus.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(BusEvent::ConfigSaved { config }) => {
                            if let Err(e) = controller.apply_config(config).await {
                                error!("Saving settings failed: {:#}", e);
                                controller.inner.bus.publish(BusEvent::notify(
                                    NotificationLevel::Error,
                                    format!("Settings not saved: {}", e),
                                ));
                            }
                        }
                        Ok(BusEvent::Notification { level, message }) => {
                            debug!("[{}] {}", level, message);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Controller lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Controller bus listener stopped");
        });
        lock(&self.inner.tasks).push(handle);
    }

    fn spawn_state_mirror(&self) {
        let model = self.inner.model.clone();
        let cancel = self.inner.cancel.clone();
        let mut state = self.inner.connection.watch_state();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = state.borrow_and_update().clone();
                        model.set_connection_state(current);
                    }
                }
            }
        });
        lock(&self.inner.tasks).push(handle);
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn destroy(&self) {
        if !self.inner.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down pantry hub bridge");
        self.inner.bus.publish(BusEvent::ShuttingDown { reason: None });

        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Controller task ended abnormally: {}", e);
            }
        }

        let observer = lock(&self.inner.observer).take();
        if let Some(observer) = observer {
            self.inner.model.unobserve(observer);
        }

        self.inner.registry.cleanup().await;
        self.inner.connection.disconnect();
        info!("Shutdown complete");
    }
}
