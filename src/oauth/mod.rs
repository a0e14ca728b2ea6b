//! OAuth 2.0 three-legged authorization flow.
//!
//! Implements the authorization code flow against a loopback redirect:
//! 1. Generate a CSRF `state` and build the authorization URL
//! 2. Start the loopback listener on the registered callback port
//! 3. Hand the URL to the user (browser)
//! 4. Capture `code`/`state` from the redirect, verify `state`
//! 5. Exchange the code for tokens, discover the tenant
//! 6. Persist the credential record

mod exchange;
mod listener;
mod provider;
mod state;

pub use exchange::{select_tenant, AccessibleResource, TokenClient, TokenEndpoint, TokenResponse};
pub use listener::{parse_request_line, CallbackParams, CallbackRequest, RedirectListener};
pub use provider::{encode_component, OAuthProvider};
pub use state::{generate_state, verify_state};

use crate::config::OAuthConfig;
use crate::credentials::CredentialRecord;
use crate::error::AuthError;
use crate::lifecycle::LifecycleManager;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// What the user needs to complete the browser leg.
#[derive(Clone, Debug)]
pub struct AuthorizationPrompt {
    /// URL to open in the browser
    pub url: String,
    /// Where the redirect listener is accepting
    pub listening_on: SocketAddr,
}

/// Drives one interactive login.
pub struct Authenticator {
    provider: OAuthProvider,
    callback_port: u16,
    callback_path: String,
    callback_timeout: Duration,
    preferred_tenant: Option<String>,
    lifecycle: LifecycleManager,
}

impl Authenticator {
    pub fn new(config: &OAuthConfig, lifecycle: LifecycleManager) -> Self {
        Self {
            provider: OAuthProvider::from_config(config),
            callback_port: config.callback_port,
            callback_path: config.callback_path.clone(),
            callback_timeout: Duration::from_secs(config.callback_timeout_secs),
            preferred_tenant: config.tenant_id.clone(),
            lifecycle,
        }
    }

    /// Runs the full authorization flow.
    ///
    /// `present` receives the authorization URL once the listener is ready;
    /// it is expected to open a browser or print the URL.
    ///
    /// # Errors
    /// * `ListenerBindFailed` - callback port unavailable
    /// * `CallbackTimeout` - no redirect within the configured wait
    /// * `AuthorizationFailed` - redirect rejected or `state` mismatch; nothing is persisted
    /// * `TokenExchangeFailed` / `TenantDiscoveryFailed` / `Network` - provider leg failed
    pub async fn authenticate<F>(&self, present: F) -> Result<CredentialRecord, AuthError>
    where
        F: FnOnce(&AuthorizationPrompt),
    {
        let expected_state = generate_state();
        let listener = RedirectListener::start(self.callback_port, &self.callback_path).await?;

        let prompt = AuthorizationPrompt {
            url: self.provider.build_auth_url(&expected_state),
            listening_on: listener.local_addr(),
        };
        info!(listening_on = %prompt.listening_on, "Waiting for authorization redirect");
        present(&prompt);

        // Dropping the listener on timeout closes it without a result
        let params = match tokio::time::timeout(self.callback_timeout, listener.wait()).await {
            Ok(Some(params)) => params,
            Ok(None) => {
                return Err(AuthError::AuthorizationFailed(
                    "authorization redirect did not carry a code and state".to_string(),
                ))
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.callback_timeout.as_secs(),
                    "Gave up waiting for authorization redirect"
                );
                return Err(AuthError::CallbackTimeout);
            }
        };

        if let Err(e) = verify_state(&expected_state, &params.state) {
            warn!("Authorization redirect state mismatch, aborting flow");
            return Err(e);
        }

        self.lifecycle
            .complete_authorization(&params.code, self.preferred_tenant.as_deref())
            .await
    }
}
