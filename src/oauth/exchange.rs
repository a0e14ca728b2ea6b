//! OAuth token exchange and tenant discovery.
//!
//! Exchanges authorization codes and refresh tokens at the provider's token
//! endpoint, and lists the resources (tenants) an access token can reach.

use super::provider::{encode_component, OAuthProvider};
use crate::error::{AuthError, ExchangeError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Used when a provider omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Longer advertised lifetimes are clamped to this (one year)
const MAX_EXPIRES_IN: i64 = 365 * 24 * 3600;

/// OAuth token response (standard OAuth 2.0)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN
}

/// One entry of the accessible-resources response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibleResource {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
}

/// Provider operations the lifecycle manager depends on.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// `grant_type=authorization_code`
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ExchangeError>;

    /// `grant_type=refresh_token`
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, ExchangeError>;

    /// Every resource the access token is scoped to, in provider order
    async fn accessible_resources(
        &self,
        access_token: &str,
    ) -> Result<Vec<AccessibleResource>, ExchangeError>;
}

/// HTTP implementation of [`TokenEndpoint`].
pub struct TokenClient {
    http: reqwest::Client,
    provider: OAuthProvider,
}

impl TokenClient {
    /// Creates a client whose every request is bounded by `timeout`.
    pub fn new(provider: OAuthProvider, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, provider })
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ExchangeError> {
        debug!(url = %self.provider.token_url, "Posting to token endpoint");

        let response = self
            .http
            .post(&self.provider.token_url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(encode_form(form))
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let token = validate_grant(read_json(response).await?)?;

        debug!(
            has_refresh_token = token.refresh_token.is_some(),
            expires_in = token.expires_in,
            "Token endpoint returned tokens"
        );

        Ok(token)
    }
}

#[async_trait]
impl TokenEndpoint for TokenClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ExchangeError> {
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.provider.client_id.as_str()),
            ("client_secret", self.provider.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
        ])
        .await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, ExchangeError> {
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.provider.client_id.as_str()),
            ("client_secret", self.provider.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn accessible_resources(
        &self,
        access_token: &str,
    ) -> Result<Vec<AccessibleResource>, ExchangeError> {
        let response = self
            .http
            .get(&self.provider.resources_url)
            .header("Accept", "application/json")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        read_json(response).await
    }
}

/// Form body with the same escaping as the authorization URL.
fn encode_form(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Rejects grants no credential record can be built from.
fn validate_grant(mut token: TokenResponse) -> Result<TokenResponse, ExchangeError> {
    if token.access_token.is_empty() {
        return Err(ExchangeError::InvalidBody(
            "token response carried an empty access_token".to_string(),
        ));
    }
    if token.expires_in <= 0 {
        return Err(ExchangeError::InvalidBody(format!(
            "token response carried non-positive expires_in {}",
            token.expires_in
        )));
    }
    if token.expires_in > MAX_EXPIRES_IN {
        warn!(
            expires_in = token.expires_in,
            max = MAX_EXPIRES_IN,
            "Clamping implausible token lifetime"
        );
        token.expires_in = MAX_EXPIRES_IN;
    }
    Ok(token)
}

/// Splits a response into the three outcomes callers branch on.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ExchangeError::Network(e.to_string()))?;

    if !status.is_success() {
        let error_code = serde_json::from_str::<OAuthErrorBody>(&body)
            .ok()
            .map(|b| b.error);
        warn!(
            status = status.as_u16(),
            error_code = error_code.as_deref().unwrap_or("-"),
            "Provider returned error status"
        );
        return Err(ExchangeError::Status {
            status: status.as_u16(),
            error_code,
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| ExchangeError::InvalidBody(e.to_string()))
}

/// Picks the tenant to bind the credentials to.
///
/// The preferred id wins when the account can reach it; otherwise the first
/// resource in provider order is used.
pub fn select_tenant(
    resources: &[AccessibleResource],
    preferred: Option<&str>,
) -> Result<String, AuthError> {
    if let Some(preferred) = preferred {
        if let Some(found) = resources.iter().find(|r| r.id == preferred) {
            return Ok(found.id.clone());
        }
        warn!(
            preferred = %preferred,
            available = resources.len(),
            "Preferred tenant not accessible, falling back to first resource"
        );
    }

    resources
        .first()
        .map(|r| r.id.clone())
        .ok_or_else(|| {
            AuthError::TenantDiscoveryFailed("no accessible resources returned".to_string())
        })
}
