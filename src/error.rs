//! Error taxonomy for the token lifecycle subsystem.
//!
//! Provider and transport failures are returned as values, never panics, so
//! the API layer, the scheduler and the CLI can all branch on them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// OAuth error codes that invalidate the refresh token for good.
const TERMINAL_GRANT_ERRORS: [&str; 2] = ["invalid_grant", "unauthorized_client"];

/// Failure talking to the provider's token or discovery endpoint.
///
/// Normal negative HTTP outcomes are `Status`, not a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Connection refused, DNS failure, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response. `error_code` is the OAuth `error` field when the
    /// body carried one.
    #[error(
        "endpoint returned status {status} ({})",
        .error_code.as_deref().unwrap_or("no error code")
    )]
    Status {
        status: u16,
        error_code: Option<String>,
        body: String,
    },

    /// 2xx response whose body could not be decoded.
    #[error("unparseable response body: {0}")]
    InvalidBody(String),
}

impl ExchangeError {
    /// True when the provider rejected the grant itself, so retrying with the
    /// same refresh token can never succeed.
    pub fn is_terminal_grant(&self) -> bool {
        match self {
            ExchangeError::Status {
                error_code: Some(code),
                ..
            } => TERMINAL_GRANT_ERRORS.contains(&code.as_str()),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ExchangeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ExchangeError::Status { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }
}

/// Whether a failed refresh can be retried with the same refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshFailureKind {
    /// Full re-authentication required.
    Terminal,
    /// Retry on the next natural trigger.
    Transient,
}

impl fmt::Display for RefreshFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshFailureKind::Terminal => write!(f, "terminal"),
            RefreshFailureKind::Transient => write!(f, "transient"),
        }
    }
}

/// Errors surfaced across the lifecycle boundary.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No usable access token or tenant.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Redirect rejected (state mismatch). Security abort, never retried.
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(#[source] ExchangeError),

    #[error("tenant discovery failed: {0}")]
    TenantDiscoveryFailed(String),

    #[error("token refresh failed ({kind}): {reason}")]
    RefreshFailed {
        kind: RefreshFailureKind,
        reason: String,
    },

    #[error("could not bind redirect listener on port {port}: {source}")]
    ListenerBindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Transport-level failure, always transient.
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered 401 to a request that was already retried once
    /// with a refreshed token.
    #[error("authentication failed after token refresh")]
    AuthenticationFailed,

    #[error("timed out waiting for the authorization redirect")]
    CallbackTimeout,

    /// Non-auth failure status from the backend API.
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("credential storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl AuthError {
    /// True when the only way forward is a new interactive login.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            AuthError::NotAuthenticated
                | AuthError::AuthorizationFailed(_)
                | AuthError::TenantDiscoveryFailed(_)
                | AuthError::AuthenticationFailed
                | AuthError::RefreshFailed {
                    kind: RefreshFailureKind::Terminal,
                    ..
                }
        )
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        if self.requires_reauth() {
            format!("{}. Re-authentication needed: run the login command.", self)
        } else {
            match self {
                AuthError::ListenerBindFailed { port, .. } => format!(
                    "Port {} is already in use. Free it or configure another callback port, then log in again.",
                    port
                ),
                AuthError::Storage(_) => format!("{}.", self),
                _ => format!("{}. Temporary failure, will retry.", self),
            }
        }
    }
}

impl From<ExchangeError> for AuthError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Network(msg) => AuthError::Network(msg),
            other => AuthError::TokenExchangeFailed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(code: Option<&str>) -> ExchangeError {
        ExchangeError::Status {
            status: 400,
            error_code: code.map(|c| c.to_string()),
            body: String::new(),
        }
    }

    #[test]
    fn test_terminal_grant_codes() {
        assert!(status_error(Some("invalid_grant")).is_terminal_grant());
        assert!(status_error(Some("unauthorized_client")).is_terminal_grant());
        assert!(!status_error(Some("temporarily_unavailable")).is_terminal_grant());
        assert!(!status_error(None).is_terminal_grant());
        assert!(!ExchangeError::Network("timeout".to_string()).is_terminal_grant());
    }

    #[test]
    fn test_status_display_includes_code() {
        let err = status_error(Some("invalid_grant"));
        assert_eq!(err.to_string(), "endpoint returned status 400 (invalid_grant)");

        let err = status_error(None);
        assert_eq!(err.to_string(), "endpoint returned status 400 (no error code)");
    }

    #[test]
    fn test_user_message_distinguishes_terminal_from_transient() {
        let terminal = AuthError::RefreshFailed {
            kind: RefreshFailureKind::Terminal,
            reason: "invalid_grant".to_string(),
        };
        assert!(terminal.requires_reauth());
        assert!(terminal.user_message().contains("Re-authentication needed"));

        let transient = AuthError::RefreshFailed {
            kind: RefreshFailureKind::Transient,
            reason: "status 503".to_string(),
        };
        assert!(!transient.requires_reauth());
        assert!(transient.user_message().contains("will retry"));
    }

    #[test]
    fn test_network_exchange_error_maps_to_network() {
        let err: AuthError = ExchangeError::Network("connection refused".to_string()).into();
        assert!(matches!(err, AuthError::Network(_)));

        let err: AuthError = status_error(Some("invalid_request")).into();
        assert!(matches!(err, AuthError::TokenExchangeFailed(_)));
    }
}
