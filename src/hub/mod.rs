//! Home-automation hub capability
//!
//! The connection service and auth manager depend only on the traits in this
//! module. `websocket` speaks the real Home Assistant WebSocket API, `mock` is
//! a scriptable in-process hub for tests.
//!
//! ```text
//! Hub ── get_auth / long_lived_auth ──► HubAuth (session, refreshes tokens)
//!  │
//!  └── create_connection(HubAuth) ──► HubConnection
//!                                        ├── fetch_states()
//!                                        ├── subscribe_state_changes(ids, sink) ──► HubSubscription
//!                                        └── lifecycle(): Ready | Disconnected | ReconnectError
//! ```

pub mod entity;
pub mod error;
pub mod mock;
pub mod oauth;
pub mod websocket;

pub use entity::{is_valid_entity_id, EntityMap, EntityState};
pub use error::HubError;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Auth
// =============================================================================

/// Token bundle issued by the hub's delegated (authorization code) flow.
///
/// Field names follow the hub client library's persisted format so stored
/// bundles stay readable by either side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBundle {
    #[serde(rename = "hassUrl")]
    pub hub_url: String,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Absolute expiry, milliseconds since the epoch
    pub expires: i64,
    /// Lifetime in seconds as reported by the hub
    pub expires_in: u64,
}

/// Refresh this long before the hub would reject the token
const EXPIRY_MARGIN_MS: i64 = 10_000;

impl TokenBundle {
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp_millis() + EXPIRY_MARGIN_MS >= self.expires
    }
}

/// Callback the session invokes whenever tokens are issued or refreshed
pub type SaveTokens = Arc<dyn Fn(Option<TokenBundle>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback the session uses to retrieve previously persisted tokens
pub type LoadTokens = Arc<dyn Fn() -> BoxFuture<'static, Option<TokenBundle>> + Send + Sync>;

/// Options for the delegated auth flow
#[derive(Clone)]
pub struct AuthOptions {
    pub hub_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// Authorization code from an OAuth callback, exchanged instead of loading tokens
    pub auth_code: Option<String>,
    pub load_tokens: Option<LoadTokens>,
    pub save_tokens: Option<SaveTokens>,
}

impl std::fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOptions")
            .field("hub_url", &self.hub_url)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("auth_code", &self.auth_code.as_deref().map(redact))
            .finish_non_exhaustive()
    }
}

/// An authenticated session handle
#[async_trait]
pub trait HubAuth: Send + Sync {
    fn hub_url(&self) -> &str;

    /// A currently valid access token, refreshing first if the session supports it
    async fn access_token(&self) -> Result<String, HubError>;

    /// Token bundle for delegated sessions, `None` for static tokens
    async fn token_bundle(&self) -> Option<TokenBundle> {
        None
    }
}

/// Static long-lived token session (no refresh flow)
pub struct LongLivedAuth {
    hub_url: String,
    token: String,
}

impl LongLivedAuth {
    pub fn new(hub_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl HubAuth for LongLivedAuth {
    fn hub_url(&self) -> &str {
        &self.hub_url
    }

    async fn access_token(&self) -> Result<String, HubError> {
        Ok(self.token.clone())
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Lifecycle signals emitted by a hub connection
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// (Re)authenticated and ready for commands
    Ready,
    /// Socket closed; the transport may try to reconnect
    Disconnected,
    /// A reconnect attempt failed
    ReconnectError(HubError),
}

/// Receives every state change for the entities a subscription asked for
pub type StateSink = Arc<dyn Fn(EntityState) + Send + Sync>;

/// Handle to one upstream change subscription
pub trait HubSubscription: Send + Sync {
    /// Detach from the hub. Errors are reported, never panicked on.
    fn cancel(&self) -> Result<(), HubError>;
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Whether the transport is open and authenticated right now
    fn is_open(&self) -> bool;

    /// Lifecycle signal stream
    fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent>;

    /// Snapshot of all entity states
    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError>;

    /// Subscribe to state changes. Only changes for `entity_ids` reach `sink`.
    async fn subscribe_state_changes(
        &self,
        entity_ids: &[String],
        sink: StateSink,
    ) -> Result<Box<dyn HubSubscription>, HubError>;

    /// Close the transport. Safe to call more than once.
    fn close(&self);
}

/// The hub capability surface
#[async_trait]
pub trait Hub: Send + Sync {
    /// Build a delegated-auth session: exchange `auth_code` if present,
    /// otherwise load stored tokens (refreshing them if expired).
    async fn get_auth(&self, options: AuthOptions) -> Result<Arc<dyn HubAuth>, HubError>;

    /// Wrap a static long-lived token
    fn long_lived_auth(&self, hub_url: &str, token: &str) -> Arc<dyn HubAuth> {
        Arc::new(LongLivedAuth::new(hub_url, token))
    }

    /// Open an authenticated connection
    async fn create_connection(
        &self,
        auth: Arc<dyn HubAuth>,
    ) -> Result<Arc<dyn HubConnection>, HubError>;
}

/// Render a secret for logs: first four characters and the length
pub fn redact(secret: &str) -> String {
    let head: String = secret.chars().take(4).collect();
    format!("{}… ({} chars)", head, secret.chars().count())
}
