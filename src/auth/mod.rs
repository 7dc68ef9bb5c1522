//! Auth Manager
//!
//! Builds authenticated hub sessions with one of two strategies and keeps the
//! credentials in the persistent store:
//!
//! - **Delegated**: authorization-code exchange plus refresh tokens. The hub
//!   session loads and saves the token bundle through store-backed callbacks,
//!   so every refresh is persisted.
//! - **Long-lived**: a single static token, stored verbatim.
//!
//! Presence checks and clearing never touch the network.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hub::{redact, AuthOptions, Hub, HubAuth, HubError, LoadTokens, SaveTokens, TokenBundle};
use crate::store::{keys, Store, StoreError};

/// Which credential strategy the configuration selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    Delegated,
    LongLived,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::LongLived => "longLived",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "delegated" | "oauth" => Ok(Self::Delegated),
            "longLived" | "long_lived" | "token" => Ok(Self::LongLived),
            other => Err(format!("unknown auth method: {}", other)),
        }
    }
}

/// A persisted credential
#[derive(Clone, PartialEq)]
pub enum Credential {
    Delegated(TokenBundle),
    LongLived(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delegated(bundle) => f
                .debug_struct("Delegated")
                .field("hub_url", &bundle.hub_url)
                .field("access_token", &redact(&bundle.access_token))
                .field("expires", &bundle.expires)
                .finish(),
            Self::LongLived(token) => f.debug_tuple("LongLived").field(&redact(token)).finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("long-lived token must not be empty")]
    EmptyToken,
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Hub(e) if e.is_retryable())
    }
}

/// Creates and persists hub credentials
#[derive(Clone)]
pub struct AuthManager {
    store: Store,
    hub: Arc<dyn Hub>,
    client_id: String,
    redirect_uri: String,
}

impl AuthManager {
    pub fn new(
        store: Store,
        hub: Arc<dyn Hub>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hub,
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn save_callback(&self) -> SaveTokens {
        let store = self.store.clone();
        Arc::new(move |tokens: Option<TokenBundle>| {
            let store = store.clone();
            async move {
                let result = match &tokens {
                    Some(bundle) => store.set_json(keys::DELEGATED_TOKENS, bundle).await,
                    None => store.remove(keys::DELEGATED_TOKENS).await,
                };
                match result {
                    Ok(()) if tokens.is_some() => debug!("Hub tokens saved"),
                    Ok(()) => debug!("Hub tokens removed"),
                    Err(e) => warn!("Failed to persist hub tokens: {}", e),
                }
            }
            .boxed()
        })
    }

    fn load_callback(&self) -> LoadTokens {
        let store = self.store.clone();
        Arc::new(move || {
            let store = store.clone();
            async move { load_tokens(&store).await }.boxed()
        })
    }

    fn delegated_options(&self, hub_url: &str, auth_code: Option<String>) -> AuthOptions {
        AuthOptions {
            hub_url: hub_url.to_string(),
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            auth_code,
            load_tokens: Some(self.load_callback()),
            save_tokens: Some(self.save_callback()),
        }
    }

    /// Delegated session from stored tokens (refreshed when expired).
    ///
    /// Fails with `AuthorizationRequired` when nothing is stored yet.
    pub async fn create_delegated_auth(&self, hub_url: &str) -> Result<Arc<dyn HubAuth>, HubError> {
        self.hub
            .get_auth(self.delegated_options(hub_url, None))
            .await
    }

    /// Exchange an authorization code from the OAuth callback and persist the result
    pub async fn exchange_auth_code(
        &self,
        hub_url: &str,
        code: &str,
    ) -> Result<Arc<dyn HubAuth>, AuthError> {
        info!("Exchanging authorization code {} with {}", redact(code), hub_url);
        let auth = self
            .hub
            .get_auth(self.delegated_options(hub_url, Some(code.to_string())))
            .await?;
        self.set_auth_method(AuthMethod::Delegated).await?;
        Ok(auth)
    }

    /// Wrap a static token and persist it verbatim
    pub async fn create_static_auth(
        &self,
        hub_url: &str,
        token: &str,
    ) -> Result<Arc<dyn HubAuth>, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        self.store.set(keys::LONG_LIVED_TOKEN, token).await?;
        self.set_auth_method(AuthMethod::LongLived).await?;
        debug!("Stored long-lived token {}", redact(token));
        Ok(self.hub.long_lived_auth(hub_url, token))
    }

    /// Session for `method` from stored credentials only.
    ///
    /// A missing static token reads as `InvalidAuth`: the user has to enter it again.
    pub async fn create_auth(
        &self,
        hub_url: &str,
        method: AuthMethod,
    ) -> Result<Arc<dyn HubAuth>, HubError> {
        match method {
            AuthMethod::Delegated => self.create_delegated_auth(hub_url).await,
            AuthMethod::LongLived => match self.stored_static_token().await {
                Some(token) => Ok(self.hub.long_lived_auth(hub_url, &token)),
                None => Err(HubError::InvalidAuth),
            },
        }
    }

    pub async fn has_delegated_auth(&self) -> bool {
        self.store.contains(keys::DELEGATED_TOKENS).await
    }

    pub async fn has_static_auth(&self) -> bool {
        self.stored_static_token().await.is_some()
    }

    /// Whether a credential usable for `method` is stored
    pub async fn has_credential(&self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::Delegated => self.has_delegated_auth().await,
            AuthMethod::LongLived => self.has_static_auth().await,
        }
    }

    /// Stored static token, if non-blank
    pub async fn stored_static_token(&self) -> Option<String> {
        self.store
            .get(keys::LONG_LIVED_TOKEN)
            .await
            .filter(|t| !t.trim().is_empty())
    }

    pub async fn stored_tokens(&self) -> Option<TokenBundle> {
        load_tokens(&self.store).await
    }

    pub async fn credential(&self, method: AuthMethod) -> Option<Credential> {
        match method {
            AuthMethod::Delegated => self.stored_tokens().await.map(Credential::Delegated),
            AuthMethod::LongLived => self.stored_static_token().await.map(Credential::LongLived),
        }
    }

    pub async fn auth_method(&self) -> Option<AuthMethod> {
        let raw = self.store.get(keys::AUTH_METHOD).await?;
        match raw.parse() {
            Ok(method) => Some(method),
            Err(e) => {
                warn!("Ignoring stored auth method: {}", e);
                None
            }
        }
    }

    pub async fn set_auth_method(&self, method: AuthMethod) -> Result<(), StoreError> {
        self.store.set(keys::AUTH_METHOD, method.as_str()).await
    }

    /// Drop the delegated token bundle only
    pub async fn clear_delegated_auth(&self) -> Result<(), StoreError> {
        self.store.remove(keys::DELEGATED_TOKENS).await
    }

    /// Remove every stored credential and the recorded auth method
    pub async fn clear_all_auth(&self) -> Result<(), StoreError> {
        self.store.remove(keys::DELEGATED_TOKENS).await?;
        self.store.remove(keys::LONG_LIVED_TOKEN).await?;
        self.store.remove(keys::AUTH_METHOD).await?;
        info!("Cleared all stored hub credentials");
        Ok(())
    }
}

async fn load_tokens(store: &Store) -> Option<TokenBundle> {
    match store.get_json::<TokenBundle>(keys::DELEGATED_TOKENS).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("Ignoring unreadable hub tokens: {}", e);
            None
        }
    }
}
