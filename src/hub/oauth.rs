//! Delegated auth (authorization code + refresh token) against the hub's
//! token endpoint.
//!
//! Flow:
//! 1. No tokens stored → `AuthorizationRequired` carrying the authorize URL.
//! 2. User authorizes, hub redirects back with `?auth_callback=1&code=…&state=…`.
//! 3. The code is exchanged at `/auth/token`; tokens are handed to the save callback.
//! 4. Expired access tokens are refreshed on demand and saved again.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{redact, AuthOptions, HubAuth, HubError, SaveTokens, TokenBundle};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameter that flags a pending authorization callback
pub const CALLBACK_FLAG: &str = "auth_callback";

/// Content of the OAuth `state` parameter, so the callback knows which hub issued the code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthState {
    #[serde(rename = "hassUrl")]
    pub hub_url: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

pub fn encode_state(state: &OAuthState) -> String {
    let json = serde_json::to_string(state).unwrap_or_default();
    STANDARD.encode(json)
}

pub fn decode_state(raw: &str) -> Option<OAuthState> {
    let bytes = STANDARD.decode(raw.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Build the URL the user must visit to authorize this client
pub fn authorize_url(hub_url: &str, client_id: &str, redirect_uri: &str) -> String {
    let state = encode_state(&OAuthState {
        hub_url: hub_url.to_string(),
        client_id: client_id.to_string(),
    });
    let redirect = if redirect_uri.contains(CALLBACK_FLAG) {
        redirect_uri.to_string()
    } else {
        let sep = if redirect_uri.contains('?') { '&' } else { '?' };
        format!("{}{}{}=1", redirect_uri, sep, CALLBACK_FLAG)
    };
    format!(
        "{}/auth/authorize?response_type=code&redirect_uri={}&client_id={}&state={}",
        hub_url.trim_end_matches('/'),
        urlencoding::encode(&redirect),
        urlencoding::encode(client_id),
        urlencoding::encode(&state),
    )
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub fn http_client() -> Client {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        })
}

fn map_transport_error(e: reqwest::Error) -> HubError {
    if e.is_timeout() {
        HubError::Timeout
    } else if e.is_connect() {
        HubError::CannotConnect
    } else {
        HubError::Network(e.to_string())
    }
}

async fn token_request(
    http: &Client,
    hub_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, HubError> {
    let url = format!("{}/auth/token", hub_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .form(form)
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = response.status();
    if status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN {
        // invalid_grant / invalid_client
        return Err(HubError::InvalidAuth);
    }
    if !status.is_success() {
        return Err(HubError::Http {
            status: status.as_u16(),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| HubError::Protocol(format!("invalid token response: {}", e)))
}

fn bundle_from_response(
    hub_url: &str,
    client_id: &str,
    response: TokenResponse,
    previous_refresh: Option<String>,
) -> TokenBundle {
    TokenBundle {
        hub_url: hub_url.to_string(),
        client_id: Some(client_id.to_string()),
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(previous_refresh),
        expires: chrono::Utc::now().timestamp_millis() + (response.expires_in as i64) * 1000,
        expires_in: response.expires_in,
    }
}

/// Exchange an authorization code for a token bundle
pub async fn exchange_code(
    http: &Client,
    hub_url: &str,
    client_id: &str,
    code: &str,
) -> Result<TokenBundle, HubError> {
    debug!("Exchanging authorization code {}", redact(code));
    let response = token_request(
        http,
        hub_url,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client_id),
        ],
    )
    .await?;
    Ok(bundle_from_response(hub_url, client_id, response, None))
}

/// Refresh an access token
pub async fn refresh_tokens(http: &Client, tokens: &TokenBundle) -> Result<TokenBundle, HubError> {
    let refresh_token = tokens.refresh_token.as_deref().ok_or(HubError::InvalidAuth)?;
    let client_id = tokens.client_id.clone().unwrap_or_default();
    let response = token_request(
        http,
        &tokens.hub_url,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id.as_str()),
        ],
    )
    .await?;
    Ok(bundle_from_response(
        &tokens.hub_url,
        &client_id,
        response,
        tokens.refresh_token.clone(),
    ))
}

/// Delegated session: holds the current bundle and refreshes it on demand
pub struct OAuthSession {
    http: Client,
    hub_url: String,
    tokens: RwLock<TokenBundle>,
    save: Option<SaveTokens>,
}

impl OAuthSession {
    pub fn new(http: Client, tokens: TokenBundle, save: Option<SaveTokens>) -> Self {
        Self {
            http,
            hub_url: tokens.hub_url.clone(),
            tokens: RwLock::new(tokens),
            save,
        }
    }

    /// Refresh now and report the new bundle through the save callback
    pub async fn refresh(&self) -> Result<TokenBundle, HubError> {
        let current = { self.tokens.read().await.clone() };
        let refreshed = refresh_tokens(&self.http, &current).await?;
        {
            *self.tokens.write().await = refreshed.clone();
        }
        info!("Hub access token refreshed");
        if let Some(save) = &self.save {
            save(Some(refreshed.clone())).await;
        }
        Ok(refreshed)
    }
}

#[async_trait]
impl HubAuth for OAuthSession {
    fn hub_url(&self) -> &str {
        &self.hub_url
    }

    async fn access_token(&self) -> Result<String, HubError> {
        let current = { self.tokens.read().await.clone() };
        if !current.is_expired() {
            return Ok(current.access_token);
        }
        Ok(self.refresh().await?.access_token)
    }

    async fn token_bundle(&self) -> Option<TokenBundle> {
        Some(self.tokens.read().await.clone())
    }
}

/// Delegated `get_auth` over HTTP, shared by hub implementations that talk to a real hub
pub async fn get_auth(http: &Client, options: AuthOptions) -> Result<Arc<dyn HubAuth>, HubError> {
    let hub_url = options.hub_url.trim_end_matches('/').to_string();
    if hub_url.is_empty() {
        return Err(HubError::HostRequired);
    }

    if let Some(code) = options.auth_code.as_deref() {
        let tokens = exchange_code(http, &hub_url, &options.client_id, code).await?;
        if let Some(save) = &options.save_tokens {
            save(Some(tokens.clone())).await;
        }
        return Ok(Arc::new(OAuthSession::new(
            http.clone(),
            tokens,
            options.save_tokens,
        )));
    }

    let stored = match &options.load_tokens {
        Some(load) => load().await,
        None => None,
    };

    match stored {
        Some(tokens) if tokens.hub_url.trim_end_matches('/') == hub_url => {
            let session = OAuthSession::new(http.clone(), tokens.clone(), options.save_tokens);
            if tokens.is_expired() {
                session.refresh().await?;
            }
            Ok(Arc::new(session))
        }
        Some(tokens) => {
            debug!(
                "Stored tokens belong to {}, not {}; ignoring",
                tokens.hub_url, hub_url
            );
            Err(HubError::AuthorizationRequired {
                authorize_url: authorize_url(&hub_url, &options.client_id, &options.redirect_uri),
            })
        }
        None => Err(HubError::AuthorizationRequired {
            authorize_url: authorize_url(&hub_url, &options.client_id, &options.redirect_uri),
        }),
    }
}
