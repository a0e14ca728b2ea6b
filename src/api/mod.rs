//! Authenticated calls to the tenant-scoped REST API.
//!
//! Every request carries the current access token and addresses
//! `{base_url}/{tenant_id}/{path}`. A 401 buys exactly one refresh and one
//! retry per call; the retried request cannot recover again.

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::lifecycle::LifecycleManager;
use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which leg of a call is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    AfterRefresh,
}

/// Outcome of one HTTP round trip.
enum Reply {
    Success(Value),
    Unauthorized,
}

pub struct ApiClient {
    http: Client,
    lifecycle: LifecycleManager,
    base_url: String,
}

impl ApiClient {
    pub fn new(lifecycle: LifecycleManager, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            lifecycle,
            base_url: base_url.into(),
        })
    }

    pub fn from_config(lifecycle: LifecycleManager, config: &AuthConfig) -> Result<Self> {
        Self::new(
            lifecycle,
            config.api.gateway_url.clone(),
            Duration::from_secs(config.oauth.http_timeout_secs),
        )
    }

    pub async fn get(&self, path: &str) -> Result<Value, AuthError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, AuthError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Sends a request, recovering from one 401 with a refresh.
    ///
    /// A 401 on the retried request is returned as `AuthenticationFailed`
    /// without refreshing again.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, AuthError> {
        match self.request_once(&method, path, body, Attempt::Initial).await? {
            Reply::Success(value) => return Ok(value),
            Reply::Unauthorized => {}
        }

        info!(method = %method, path, "API returned 401, refreshing token and retrying once");
        self.lifecycle.refresh().await?;

        match self
            .request_once(&method, path, body, Attempt::AfterRefresh)
            .await?
        {
            Reply::Success(value) => Ok(value),
            Reply::Unauthorized => {
                warn!(method = %method, path, "API returned 401 after refresh");
                Err(AuthError::AuthenticationFailed)
            }
        }
    }

    async fn request_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        attempt: Attempt,
    ) -> Result<Reply, AuthError> {
        let tenant_id = self
            .lifecycle
            .get_tenant_id()
            .ok_or(AuthError::NotAuthenticated)?;
        let token = match attempt {
            Attempt::Initial => self.lifecycle.valid_access_token().await?,
            // The refresh just ran; never start another one from here
            Attempt::AfterRefresh => self
                .lifecycle
                .get_access_token()
                .ok_or(AuthError::NotAuthenticated)?,
        };

        let url = self.url_for(&tenant_id, path);
        debug!(method = %method, url = %url, ?attempt, "Sending API request");

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header("Accept", "application/json")
            .bearer_auth(&token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Ok(Reply::Unauthorized);
        }

        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), path, "API request failed");
            return Err(AuthError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Reply::Success(Value::Null));
        }
        Ok(Reply::Success(
            serde_json::from_str(&text).unwrap_or(Value::String(text)),
        ))
    }

    fn url_for(&self, tenant_id: &str, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(tenant_id),
            path.trim_start_matches('/')
        )
    }
}
