//! Connection Service
//!
//! Owns the single logical connection to the hub.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ready──► Ready
//!      ▲                          │                   │
//!      │                  retries exhausted       disconnected
//!      └──────────────────────────┴───────────────────┘
//!
//! reconnect-error(InvalidAuth) ──► AuthError ──recreate ok──► connect()
//!                                      └────recreate fails──► Disconnected + notice
//! ```
//!
//! Modules reach the hub only through [`ConnectionService::subscribe`]. Each
//! call gets its own key, its own upstream change subscription and its own
//! merged entity map, so concurrent subscribers never collide.
//!
//! Every connect attempt runs under a generation number and cancellation
//! token. `disconnect()` bumps the generation and cancels the token, so an
//! in-flight retry sequence wakes up, sees it is stale and discards its result.

pub mod retry;

pub use retry::{with_retry, RetryPolicy};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthManager, AuthMethod};
use crate::bus::{BusEvent, NotificationLevel, SharedBus};
use crate::hub::{
    EntityMap, EntityState, Hub, HubAuth, HubConnection, HubError, HubSubscription,
    LifecycleEvent, StateSink,
};

/// Watchdog delay after a successful connect call
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    /// Credentials were rejected; recovery in progress or user action needed
    AuthError,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::AuthError => "auth_error",
        };
        f.write_str(s)
    }
}

/// Connection state owned by the service and mirrored by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    /// Whether a transport handle exists (it may be reconnecting)
    pub has_connection: bool,
    pub last_error: Option<String>,
}

/// What the service connects to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSettings {
    pub hub_url: String,
    pub auth_method: Option<AuthMethod>,
}

/// Receives the merged entity map of one subscription
pub type SubscriptionCallback = Arc<dyn Fn(&EntityMap) + Send + Sync>;

// =============================================================================
// Subscriptions
// =============================================================================

struct TrackedSubscription {
    key: u64,
    entity_ids: HashSet<String>,
    active: AtomicBool,
    entities: Mutex<EntityMap>,
    upstream: Mutex<Option<Box<dyn HubSubscription>>>,
    callback: SubscriptionCallback,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TrackedSubscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns true for the call that actually deactivated
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Keep the upstream handle, or cancel it right away if we were
    /// deactivated while it was being created
    fn attach_upstream(&self, handle: Box<dyn HubSubscription>) {
        let mut slot = lock(&self.upstream);
        if self.is_active() {
            *slot = Some(handle);
            return;
        }
        drop(slot);
        if let Err(e) = handle.cancel() {
            warn!("Failed to cancel late subscription {}: {}", self.key, e);
        }
    }

    fn detach_upstream(&self) {
        let handle = lock(&self.upstream).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.cancel() {
                warn!("Failed to cancel subscription {}: {}", self.key, e);
            }
        }
    }

    fn deliver(&self, state: EntityState) {
        if !self.is_active() || !self.entity_ids.contains(&state.entity_id) {
            return;
        }
        let merged = {
            let mut entities = lock(&self.entities);
            entities.insert(state.entity_id.clone(), state);
            entities.clone()
        };
        if self.is_active() {
            (self.callback)(&merged);
        }
    }

    /// Merge a snapshot. Entries already filled by change events win.
    fn merge_snapshot(&self, states: Vec<EntityState>) {
        let merged = {
            let mut entities = lock(&self.entities);
            let mut added = false;
            for state in states {
                if self.entity_ids.contains(&state.entity_id)
                    && !entities.contains_key(&state.entity_id)
                {
                    entities.insert(state.entity_id.clone(), state);
                    added = true;
                }
            }
            added.then(|| entities.clone())
        };
        if let Some(merged) = merged {
            if self.is_active() {
                (self.callback)(&merged);
            }
        }
    }
}

/// Handle returned by [`ConnectionService::subscribe`]
pub struct Unsubscribe {
    inner: Option<(Weak<Inner>, Arc<TrackedSubscription>)>,
}

impl Unsubscribe {
    /// Handle that does nothing (returned when not connected)
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Stop deliveries and detach upstream. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        let Some((service, tracked)) = &self.inner else {
            return;
        };
        if !tracked.deactivate() {
            return;
        }
        if let Some(service) = service.upgrade() {
            service.subscriptions().remove(&tracked.key);
        }
        tracked.detach_upstream();
        debug!("Subscription {} removed", tracked.key);
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|(_, tracked)| tracked.is_active())
    }

    pub fn key(&self) -> Option<u64> {
        self.inner.as_ref().map(|(_, tracked)| tracked.key)
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key())
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Service
// =============================================================================

struct Session {
    connection: Option<Arc<dyn HubConnection>>,
    auth: Option<Arc<dyn HubAuth>>,
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    hub: Arc<dyn Hub>,
    auth: AuthManager,
    bus: SharedBus,
    policy: RetryPolicy,
    watchdog: Duration,
    settings: RwLock<ConnectionSettings>,
    session: Mutex<Session>,
    subscriptions: Mutex<HashMap<u64, Arc<TrackedSubscription>>>,
    next_key: AtomicU64,
    ready_fired: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<u64, Arc<TrackedSubscription>>> {
        lock(&self.subscriptions)
    }
}

/// Where a rejected credential was noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFailure {
    /// `connect()` itself was refused; the credential was just built from storage
    Connect,
    /// The transport's reconnect was refused; rebuilding may help
    Reconnect,
}

#[derive(Clone)]
pub struct ConnectionService {
    inner: Arc<Inner>,
}

impl ConnectionService {
    pub fn new(hub: Arc<dyn Hub>, auth: AuthManager, bus: SharedBus, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            inner: Arc::new(Inner {
                hub,
                auth,
                bus,
                policy,
                watchdog: DEFAULT_WATCHDOG,
                settings: RwLock::new(ConnectionSettings::default()),
                session: Mutex::new(Session {
                    connection: None,
                    auth: None,
                    generation: 0,
                    cancel: CancellationToken::new(),
                }),
                subscriptions: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(1),
                ready_fired: AtomicBool::new(false),
                state,
            }),
        }
    }

    /// Override the watchdog delay (must be called before sharing the service)
    pub fn with_watchdog(self, watchdog: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.watchdog = watchdog;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("Watchdog not changed: service already shared");
                Self { inner }
            }
        }
    }

    pub fn configure(&self, settings: ConnectionSettings) {
        debug!(
            "Connection configured for {} ({:?})",
            settings.hub_url, settings.auth_method
        );
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions().len()
    }

    fn update_state(&self, apply: impl FnOnce(&mut ConnectionState)) {
        let mut changed = None;
        self.inner.state.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            if *state != before {
                changed = Some(state.clone());
                true
            } else {
                false
            }
        });
        if let Some(state) = changed {
            debug!("Connection state: {}", state.status);
            self.inner
                .bus
                .publish(BusEvent::ConnectionStateChanged { state });
        }
    }

    fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.inner.bus.publish(BusEvent::notify(level, message));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.session().generation == generation
    }

    /// Close the transport, cancel tracked subscriptions and bump the generation.
    /// Returns whether anything was torn down.
    fn teardown(&self) -> bool {
        let tracked: Vec<Arc<TrackedSubscription>> = self
            .inner
            .subscriptions()
            .drain()
            .map(|(_, t)| t)
            .collect();
        let had_subscriptions = !tracked.is_empty();
        for subscription in tracked {
            if subscription.deactivate() {
                subscription.detach_upstream();
            }
        }

        let connection = {
            let mut session = self.inner.session();
            session.cancel.cancel();
            session.cancel = CancellationToken::new();
            session.generation += 1;
            session.auth = None;
            session.connection.take()
        };
        self.inner.ready_fired.store(false, Ordering::SeqCst);

        let had_connection = connection.is_some();
        if let Some(connection) = connection {
            connection.close();
        }
        had_connection || had_subscriptions
    }

    fn begin_attempt(&self) -> (u64, CancellationToken) {
        if self.teardown() {
            debug!("Tore down stale connection before connecting");
        }
        let session = self.inner.session();
        (session.generation, session.cancel.clone())
    }

    /// Connect to the configured hub.
    ///
    /// No-op success when already connected. Retryable failures are retried
    /// with backoff; rejected credentials fail at once and run the auth-error
    /// path. Returns whether the connection is now established.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        let settings = self.settings();
        let hub_url = settings.hub_url.trim().to_string();
        let Some(method) = settings.auth_method else {
            self.fail_config("No authentication method configured");
            return false;
        };
        if hub_url.is_empty() {
            self.fail_config("Hub URL is not configured");
            return false;
        }
        if !self.inner.auth.has_credential(method).await {
            self.fail_config("No credentials stored for the hub");
            return false;
        }

        let (generation, cancel) = self.begin_attempt();
        self.update_state(|s| {
            s.status = ConnectionStatus::Connecting;
            s.is_connected = false;
            s.has_connection = false;
            s.last_error = None;
        });
        info!("Connecting to hub at {} ({})", hub_url, method);

        let attempt = with_retry(&self.inner.policy, "hub connect", &cancel, || {
            let inner = self.inner.clone();
            let hub_url = hub_url.clone();
            async move {
                let auth = inner.auth.create_auth(&hub_url, method).await?;
                let connection = inner.hub.create_connection(auth.clone()).await?;
                Ok((auth, connection))
            }
        })
        .await;

        if !self.is_current(generation) {
            if let Ok((_, connection)) = &attempt {
                connection.close();
            }
            debug!("Discarding result of a superseded connect attempt");
            return false;
        }

        match attempt {
            Ok((auth, connection)) => {
                self.install(generation, &cancel, auth, connection);
                true
            }
            Err(HubError::Cancelled) => false,
            Err(e) if e.is_auth_error() => {
                self.handle_auth_error(AuthFailure::Connect).await;
                false
            }
            Err(HubError::AuthorizationRequired { authorize_url }) => {
                warn!("Hub authorization required: {}", authorize_url);
                self.update_state(|s| {
                    s.status = ConnectionStatus::AuthError;
                    s.last_error = Some("authorization required".to_string());
                });
                self.notify(
                    NotificationLevel::Warning,
                    format!("Authorize access to the hub: {}", authorize_url),
                );
                false
            }
            Err(e) => {
                error!("Hub connection failed: {}", e);
                self.update_state(|s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.is_connected = false;
                    s.last_error = Some(e.to_string());
                });
                self.notify(
                    NotificationLevel::Error,
                    format!("Could not connect to the hub: {}", e),
                );
                false
            }
        }
    }

    fn connect_boxed(&self) -> BoxFuture<'static, bool> {
        let service = self.clone();
        async move { service.connect().await }.boxed()
    }

    fn fail_config(&self, message: &str) {
        warn!("Not connecting: {}", message);
        self.update_state(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.is_connected = false;
            s.last_error = Some(message.to_string());
        });
        self.notify(NotificationLevel::Warning, message);
    }

    fn install(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        auth: Arc<dyn HubAuth>,
        connection: Arc<dyn HubConnection>,
    ) {
        // Subscribe before checking is_open so a racing Ready is not lost
        let lifecycle = connection.lifecycle();
        {
            let mut session = self.inner.session();
            session.auth = Some(auth);
            session.connection = Some(connection.clone());
        }
        self.update_state(|s| s.has_connection = true);

        self.spawn_lifecycle_listener(generation, cancel.clone(), lifecycle);
        if connection.is_open() {
            self.fire_ready(generation);
        }
        self.spawn_watchdog(generation, cancel.clone());
    }

    fn spawn_lifecycle_listener(
        &self,
        generation: u64,
        cancel: CancellationToken,
        mut lifecycle: broadcast::Receiver<LifecycleEvent>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = lifecycle.recv() => match event {
                        Ok(LifecycleEvent::Ready) => service.fire_ready(generation),
                        Ok(LifecycleEvent::Disconnected) => service.on_disconnected(generation),
                        Ok(LifecycleEvent::ReconnectError(e)) if e.is_auth_error() => {
                            if service.is_current(generation) {
                                service.handle_auth_error(AuthFailure::Reconnect).await;
                            }
                        }
                        Ok(LifecycleEvent::ReconnectError(e)) => {
                            debug!("Hub reconnect attempt failed: {}", e);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Lifecycle listener lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Lifecycle listener for generation {} stopped", generation);
        });
    }

    fn spawn_watchdog(&self, generation: u64, cancel: CancellationToken) {
        let service = self.clone();
        let delay = self.inner.watchdog;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if service.is_current(generation) && !service.is_connected() {
                        warn!("Hub connection not ready {:?} after connect", delay);
                    }
                }
            }
        });
    }

    /// Ready logic; runs at most once per established connection
    fn fire_ready(&self, generation: u64) {
        {
            let session = self.inner.session();
            if session.generation != generation || session.connection.is_none() {
                return;
            }
        }
        if self.inner.ready_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Hub connection ready");
        self.update_state(|s| {
            s.status = ConnectionStatus::Ready;
            s.is_connected = true;
            s.has_connection = true;
            s.last_error = None;
        });
        self.inner.bus.publish(BusEvent::HubConnected);
    }

    fn on_disconnected(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.inner.ready_fired.store(false, Ordering::SeqCst);
        warn!("Hub connection lost");
        self.update_state(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.is_connected = false;
        });
        self.inner.bus.publish(BusEvent::HubDisconnected {
            reason: Some("connection lost".to_string()),
        });
    }

    /// Rejected credentials: drop the session credential and try to rebuild it.
    ///
    /// Returns whether the connection was recovered.
    async fn handle_auth_error(&self, origin: AuthFailure) -> bool {
        warn!("Hub rejected credentials ({:?})", origin);
        self.inner.session().auth = None;
        self.update_state(|s| {
            s.status = ConnectionStatus::AuthError;
            s.is_connected = false;
            s.last_error = Some(HubError::InvalidAuth.to_string());
        });

        let settings = self.settings();
        let method = settings.auth_method;

        if origin == AuthFailure::Reconnect {
            let nothing_stored = method == Some(AuthMethod::Delegated)
                && !self.inner.auth.has_delegated_auth().await;
            if let (Some(method), false) = (method, nothing_stored) {
                match self.inner.auth.create_auth(&settings.hub_url, method).await {
                    Ok(auth) => {
                        info!("Hub credentials recreated, reconnecting");
                        self.inner.session().auth = Some(auth);
                        // Force a fresh transport
                        self.update_state(|s| s.is_connected = false);
                        if self.connect_boxed().await {
                            return true;
                        }
                        if self.state().status != ConnectionStatus::AuthError {
                            return false;
                        }
                    }
                    Err(e) => warn!("Recreating hub credentials failed: {}", e),
                }
            }
        }

        self.notify(
            NotificationLevel::Warning,
            "The hub rejected the stored credentials. Please re-authenticate in the settings.",
        );
        if method == Some(AuthMethod::Delegated) {
            if let Err(e) = self.inner.auth.clear_delegated_auth().await {
                warn!("Failed to clear delegated tokens: {}", e);
            }
        }
        self.update_state(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.is_connected = false;
            s.last_error = Some("re-authentication required".to_string());
        });
        false
    }

    /// Subscribe to `entity_ids`.
    ///
    /// `callback` receives the merged per-entity map whenever a requested
    /// entity's state arrives, from the initial snapshot or a change. When not
    /// connected this logs a warning and returns a no-op handle.
    pub async fn subscribe(
        &self,
        entity_ids: &[String],
        callback: SubscriptionCallback,
    ) -> Unsubscribe {
        let connection = {
            let session = self.inner.session();
            session.connection.clone()
        };
        let connection = match connection {
            Some(c) if self.is_connected() => c,
            _ => {
                warn!("subscribe({:?}) while not connected; ignoring", entity_ids);
                return Unsubscribe::noop();
            }
        };

        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let tracked = Arc::new(TrackedSubscription {
            key,
            entity_ids: entity_ids.iter().cloned().collect(),
            active: AtomicBool::new(true),
            entities: Mutex::new(EntityMap::new()),
            upstream: Mutex::new(None),
            callback,
        });
        self.inner.subscriptions().insert(key, tracked.clone());

        let sink: StateSink = {
            let weak = Arc::downgrade(&tracked);
            Arc::new(move |state| {
                if let Some(tracked) = weak.upgrade() {
                    tracked.deliver(state);
                }
            })
        };

        match connection.subscribe_state_changes(entity_ids, sink).await {
            Ok(handle) => tracked.attach_upstream(handle),
            Err(e) => {
                warn!("Hub refused subscription to {:?}: {}", entity_ids, e);
                tracked.deactivate();
                self.inner.subscriptions().remove(&key);
                return Unsubscribe::noop();
            }
        }

        match connection.fetch_states().await {
            Ok(states) => tracked.merge_snapshot(states),
            Err(e) => warn!("Initial state fetch for {:?} failed: {}", entity_ids, e),
        }

        debug!("Subscription {} active for {:?}", key, entity_ids);
        Unsubscribe {
            inner: Some((Arc::downgrade(&self.inner), tracked)),
        }
    }

    /// Cancel every subscription, close the transport and reset state.
    /// Safe from any state, any number of times.
    pub fn disconnect(&self) {
        let tore_down = self.teardown();
        let was_connected = self.state().is_connected;
        self.update_state(|s| *s = ConnectionState::default());
        if tore_down || was_connected {
            info!("Disconnected from hub");
            self.inner.bus.publish(BusEvent::HubDisconnected {
                reason: Some("disconnected".to_string()),
            });
        }
    }
}
