//! Hub error sentinels and retry classification

use thiserror::Error;

/// Errors surfaced by the hub capability.
///
/// The first four variants mirror the well-known sentinel values of the hub
/// client library; the rest carry transport and protocol detail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid authentication")]
    InvalidAuth,

    #[error("cannot connect to hub")]
    CannotConnect,

    #[error("connection to hub lost")]
    ConnectionLost,

    #[error("hub URL is required")]
    HostRequired,

    /// No stored tokens and no authorization code: the user must authorize first
    #[error("authorization required, visit {authorize_url}")]
    AuthorizationRequired { authorize_url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("hub returned HTTP {status}")]
    Http { status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was abandoned because the connection was torn down
    #[error("operation cancelled")]
    Cancelled,
}

impl HubError {
    /// Transport-level failures that a bounded backoff may recover from.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CannotConnect | Self::ConnectionLost | Self::Network(_) | Self::Timeout => true,
            Self::Http { status } => (500..600).contains(status),
            Self::InvalidAuth
            | Self::HostRequired
            | Self::AuthorizationRequired { .. }
            | Self::Protocol(_)
            | Self::Cancelled => false,
        }
    }

    /// Errors that mean the credential itself is no longer accepted
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::InvalidAuth)
    }
}
