//! Programmable in-process hub for tests.
//!
//! [`MockHub`] implements [`Hub`] so the connection service, the auth manager
//! and the controller can be exercised without a network.
//!
//! # Features
//!
//! - **Failure injection**: queue errors for the next `create_connection` / `get_auth` calls
//! - **Attempt recording**: every connect attempt is stamped with tokio's clock, so
//!   backoff delays can be asserted under a paused runtime
//! - **State pushes**: `push_state` delivers to every matching live subscription
//! - **Lifecycle injection**: emit `Ready` / `Disconnected` / `ReconnectError` at will

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    AuthOptions, EntityState, Hub, HubAuth, HubConnection, HubError, HubSubscription,
    LifecycleEvent, StateSink, TokenBundle,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockSubscriptionEntry {
    entity_ids: HashSet<String>,
    sink: StateSink,
}

struct MockState {
    entities: Mutex<BTreeMap<String, EntityState>>,
    connect_failures: Mutex<VecDeque<HubError>>,
    auth_failures: Mutex<VecDeque<HubError>>,
    connect_attempts: Mutex<Vec<Instant>>,
    connected_tokens: Mutex<Vec<String>>,
    subscriptions: Mutex<HashMap<u64, MockSubscriptionEntry>>,
    next_subscription: AtomicU64,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    open: AtomicBool,
    fail_unsubscribe: AtomicBool,
    get_auth_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

/// A scriptable hub. Clones share state.
#[derive(Clone)]
pub struct MockHub {
    state: Arc<MockState>,
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHub")
            .field("open", &self.state.open.load(Ordering::SeqCst))
            .field("subscriptions", &self.active_subscriptions())
            .finish()
    }
}

impl MockHub {
    pub fn new() -> Self {
        let (lifecycle, _) = broadcast::channel(16);
        Self {
            state: Arc::new(MockState {
                entities: Mutex::new(BTreeMap::new()),
                connect_failures: Mutex::new(VecDeque::new()),
                auth_failures: Mutex::new(VecDeque::new()),
                connect_attempts: Mutex::new(Vec::new()),
                connected_tokens: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                lifecycle,
                open: AtomicBool::new(false),
                fail_unsubscribe: AtomicBool::new(false),
                get_auth_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Fail the next `create_connection` calls with these errors, in order
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = HubError>) {
        lock(&self.state.connect_failures).extend(errors);
    }

    /// Fail the next `get_auth` calls with these errors, in order
    pub fn fail_next_auth(&self, errors: impl IntoIterator<Item = HubError>) {
        lock(&self.state.auth_failures).extend(errors);
    }

    /// Make every `HubSubscription::cancel` report an error
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// Set an entity in the snapshot without notifying subscribers
    pub fn set_entity(&self, entity: EntityState) {
        lock(&self.state.entities).insert(entity.entity_id.clone(), entity);
    }

    /// Update the snapshot and deliver to every live subscription watching the entity
    pub fn push_state(&self, entity: EntityState) {
        self.set_entity(entity.clone());
        let sinks: Vec<StateSink> = lock(&self.state.subscriptions)
            .values()
            .filter(|s| s.entity_ids.contains(&entity.entity_id))
            .map(|s| s.sink.clone())
            .collect();
        for sink in sinks {
            sink(entity.clone());
        }
    }

    /// Inject a lifecycle signal on the current connection
    pub fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Ready => self.set_open(true),
            LifecycleEvent::Disconnected => self.set_open(false),
            LifecycleEvent::ReconnectError(_) => {}
        }
        if self.state.lifecycle.send(event).is_err() {
            tracing::debug!("Mock lifecycle event had no listeners");
        }
    }

    pub fn set_open(&self, open: bool) {
        self.state.open.store(open, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Instants of every `create_connection` call, successful or not
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state.connect_attempts).clone()
    }

    /// Access tokens presented on successful connects
    pub fn connected_tokens(&self) -> Vec<String> {
        lock(&self.state.connected_tokens).clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state.subscriptions).len()
    }

    pub fn get_auth_calls(&self) -> usize {
        self.state.get_auth_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

/// Tokens the mock "issues" for an authorization code
pub fn mock_token_bundle(hub_url: &str, client_id: &str, code: &str) -> TokenBundle {
    TokenBundle {
        hub_url: hub_url.to_string(),
        client_id: Some(client_id.to_string()),
        access_token: format!("access-{}", code),
        refresh_token: Some(format!("refresh-{}", code)),
        expires: chrono::Utc::now().timestamp_millis() + 1_800_000,
        expires_in: 1800,
    }
}

struct MockDelegatedAuth {
    tokens: TokenBundle,
}

#[async_trait]
impl HubAuth for MockDelegatedAuth {
    fn hub_url(&self) -> &str {
        &self.tokens.hub_url
    }

    async fn access_token(&self) -> Result<String, HubError> {
        Ok(self.tokens.access_token.clone())
    }

    async fn token_bundle(&self) -> Option<TokenBundle> {
        Some(self.tokens.clone())
    }
}

#[async_trait]
impl Hub for MockHub {
    async fn get_auth(&self, options: AuthOptions) -> Result<Arc<dyn HubAuth>, HubError> {
        self.state.get_auth_calls.fetch_add(1, Ordering::SeqCst);
        if options.hub_url.trim().is_empty() {
            return Err(HubError::HostRequired);
        }
        let scripted = lock(&self.state.auth_failures).pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        if let Some(code) = options.auth_code.as_deref() {
            let tokens = mock_token_bundle(&options.hub_url, &options.client_id, code);
            if let Some(save) = &options.save_tokens {
                save(Some(tokens.clone())).await;
            }
            return Ok(Arc::new(MockDelegatedAuth { tokens }));
        }

        let stored = match &options.load_tokens {
            Some(load) => load().await,
            None => None,
        };
        match stored {
            Some(tokens) => Ok(Arc::new(MockDelegatedAuth { tokens })),
            None => Err(HubError::AuthorizationRequired {
                authorize_url: super::oauth::authorize_url(
                    &options.hub_url,
                    &options.client_id,
                    &options.redirect_uri,
                ),
            }),
        }
    }

    async fn create_connection(
        &self,
        auth: Arc<dyn HubAuth>,
    ) -> Result<Arc<dyn HubConnection>, HubError> {
        lock(&self.state.connect_attempts).push(Instant::now());
        let scripted = lock(&self.state.connect_failures).pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        let token = auth.access_token().await?;
        lock(&self.state.connected_tokens).push(token);
        self.set_open(true);
        Ok(Arc::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl HubConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.state.lifecycle.subscribe()
    }

    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError> {
        self.state.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() {
            return Err(HubError::ConnectionLost);
        }
        Ok(lock(&self.state.entities).values().cloned().collect())
    }

    async fn subscribe_state_changes(
        &self,
        entity_ids: &[String],
        sink: StateSink,
    ) -> Result<Box<dyn HubSubscription>, HubError> {
        if !self.is_open() {
            return Err(HubError::ConnectionLost);
        }
        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.subscriptions).insert(
            id,
            MockSubscriptionEntry {
                entity_ids: entity_ids.iter().cloned().collect(),
                sink,
            },
        );
        Ok(Box::new(MockSubscription {
            id,
            state: self.state.clone(),
        }))
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.open.store(false, Ordering::SeqCst);
    }
}

struct MockSubscription {
    id: u64,
    state: Arc<MockState>,
}

impl HubSubscription for MockSubscription {
    fn cancel(&self) -> Result<(), HubError> {
        // Detach even when reporting failure, like a socket that died mid-unsubscribe
        lock(&self.state.subscriptions).remove(&self.id);
        if self.state.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(HubError::ConnectionLost);
        }
        Ok(())
    }
}
