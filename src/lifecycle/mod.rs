//! Token lifecycle manager.
//!
//! Owns the state machine over the persisted [`CredentialRecord`]:
//!
//! ```text
//!                 authorize
//! Unauthenticated ─────────► AuthenticatedValid ◄──────────────┐
//!        ▲                         │ now >= expires_at         │ success
//!        │                         ▼                           │
//!        │ terminal        AuthenticatedExpired ──► Refreshing ┤
//!        └─────────────────────────────────────────────────────┤
//!                                                              │ transient
//!                                          RefreshFailedRetryable
//! ```
//!
//! Reads never hand out a token known to be expired. Proactive refreshes are
//! fired in the background and overlapping refresh requests share a single
//! exchange with the provider.

use crate::clock::{Clock, SystemClock};
use crate::config::{AuthConfig, RefreshConfig};
use crate::credentials::{
    migrate, CredentialRecord, CredentialStore, RefreshErrorInfo, SCHEMA_VERSION,
};
use crate::error::{AuthError, ExchangeError, RefreshFailureKind};
use crate::oauth::{select_tenant, OAuthProvider, TokenClient, TokenEndpoint};
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};


/// Derived authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No record, no access token, no tenant, or the refresh token was rejected
    Unauthenticated,
    AuthenticatedValid,
    AuthenticatedExpired,
    Refreshing,
    /// Expired, and the last refresh failed transiently
    RefreshFailedRetryable,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::AuthenticatedValid => "authenticated",
            AuthState::AuthenticatedExpired => "access token expired",
            AuthState::Refreshing => "refreshing",
            AuthState::RefreshFailedRetryable => "refresh failed (will retry)",
        };
        write!(f, "{}", label)
    }
}

/// Why a refresh is warranted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Expired,
    NearExpiry,
    RefreshTokenAge,
    KeepAlive,
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RefreshReason::Expired => "access token expired",
            RefreshReason::NearExpiry => "access token near expiry",
            RefreshReason::RefreshTokenAge => "refresh token age limit",
            RefreshReason::KeepAlive => "keep-alive",
        };
        write!(f, "{}", label)
    }
}

/// Thresholds (seconds) for proactive refresh.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub refresh_window_secs: i64,
    pub max_refresh_token_age_secs: i64,
    pub keepalive_interval_secs: i64,
    pub refresh_token_warn_age_secs: i64,
}

impl From<&RefreshConfig> for RefreshPolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            refresh_window_secs: config.refresh_window_secs,
            max_refresh_token_age_secs: config.max_refresh_token_age_secs,
            keepalive_interval_secs: config.keepalive_interval_secs,
            refresh_token_warn_age_secs: config.refresh_token_warn_age_secs,
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from(&RefreshConfig::default())
    }
}

/// Point-in-time report for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub state: AuthState,
    pub tenant_id: Option<String>,
    pub expires_at: Option<i64>,
    /// Negative once expired
    pub expires_in_secs: Option<i64>,
    pub has_refresh_token: bool,
    pub refresh_token_age_secs: Option<i64>,
    pub last_refresh_at: Option<i64>,
    pub last_refresh_error: Option<RefreshErrorInfo>,
    /// Refresh token rejected or close to the provider's absolute lifetime
    pub reauth_recommended: bool,
}

/// Outcome shared by every caller joined on one refresh.
#[derive(Debug, Clone)]
struct RefreshFailure {
    kind: RefreshFailureKind,
    reason: String,
}

impl RefreshFailure {
    fn terminal(reason: impl Into<String>) -> Self {
        Self {
            kind: RefreshFailureKind::Terminal,
            reason: reason.into(),
        }
    }

    fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: RefreshFailureKind::Transient,
            reason: reason.into(),
        }
    }
}

impl From<RefreshFailure> for AuthError {
    fn from(failure: RefreshFailure) -> Self {
        AuthError::RefreshFailed {
            kind: failure.kind,
            reason: failure.reason,
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), RefreshFailure>>>;

struct InFlight {
    id: u64,
    future: SharedRefresh,
}

/// Owns token state for one installation.
///
/// Cheap to clone; clones share the store, the endpoint and the in-flight
/// refresh slot.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_refresh_id: Arc<AtomicU64>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            endpoint,
            clock,
            policy,
            in_flight: Arc::new(Mutex::new(None)),
            next_refresh_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Wires the HTTP token client, the file store and the wall clock.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let provider = OAuthProvider::from_config(&config.oauth);
        let client = TokenClient::new(
            provider,
            Duration::from_secs(config.oauth.http_timeout_secs),
        )?;

        Ok(Self::new(
            Arc::new(CredentialStore::new(&config.storage.credentials_path)),
            Arc::new(client),
            Arc::new(SystemClock),
            RefreshPolicy::from(&config.refresh),
        ))
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Reads the record, upgrading and persisting it when it predates the
    /// current schema.
    pub fn load_record(&self) -> Result<Option<CredentialRecord>, AuthError> {
        let Some(record) = self.store.load().map_err(AuthError::Storage)? else {
            return Ok(None);
        };
        if record.schema_version >= SCHEMA_VERSION {
            return Ok(Some(record));
        }

        let now = self.clock.now();
        let from_version = record.schema_version;
        let migrated = self
            .store
            .modify(|current| Some(migrate(current.clone(), now)))
            .map_err(AuthError::Storage)?;

        info!(
            from_version,
            to_version = SCHEMA_VERSION,
            "Migrated credential record"
        );
        Ok(migrated)
    }

    /// Returns the access token if one exists and has not expired.
    ///
    /// Never blocks on the network. When the token is expired, inside the
    /// refresh window, or the refresh token is due for renewal, a refresh is
    /// started in the background for the benefit of later calls.
    pub fn get_access_token(&self) -> Option<String> {
        let record = match self.load_record() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                return None;
            }
        };

        let now = self.clock.now();
        if let Some(reason) = self.refresh_reason(&record, now) {
            self.spawn_background_refresh(reason);
        }

        if !record.has_access_token() || record.is_expired(now) {
            return None;
        }
        record.access_token
    }

    /// Like [`get_access_token`](Self::get_access_token), but an expired
    /// token is refreshed before returning.
    pub async fn valid_access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.get_access_token() {
            return Ok(token);
        }

        let record = self.load_record()?.ok_or(AuthError::NotAuthenticated)?;
        if !record.has_access_token() || record.refresh_token.is_none() {
            return Err(AuthError::NotAuthenticated);
        }

        self.refresh().await?;
        self.get_access_token().ok_or(AuthError::NotAuthenticated)
    }

    pub fn get_tenant_id(&self) -> Option<String> {
        match self.load_record() {
            Ok(record) => record.and_then(|r| r.tenant_id),
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                None
            }
        }
    }

    /// True only when an unexpired token and a tenant are both present.
    pub fn is_authenticated(&self) -> bool {
        match self.load_record() {
            Ok(Some(record)) => record.is_usable(self.clock.now()),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                false
            }
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight_guard().is_some()
    }

    pub fn state(&self) -> AuthState {
        match self.load_record() {
            Ok(Some(record)) => self.derive_state(&record, self.clock.now()),
            Ok(None) => AuthState::Unauthenticated,
            Err(e) => {
                warn!(error = %e, "Failed to read credentials");
                AuthState::Unauthenticated
            }
        }
    }

    fn derive_state(&self, record: &CredentialRecord, now: i64) -> AuthState {
        if !record.has_access_token() || record.tenant_id.is_none() {
            return AuthState::Unauthenticated;
        }
        if self.is_refreshing() {
            return AuthState::Refreshing;
        }
        if !record.is_expired(now) {
            return AuthState::AuthenticatedValid;
        }

        match (&record.last_refresh_error, &record.refresh_token) {
            (_, None) => AuthState::Unauthenticated,
            (Some(err), _) if err.kind == RefreshFailureKind::Terminal => {
                AuthState::Unauthenticated
            }
            (Some(_), _) => AuthState::RefreshFailedRetryable,
            (None, _) => AuthState::AuthenticatedExpired,
        }
    }

    pub fn diagnostics(&self) -> Result<Diagnostics, AuthError> {
        let now = self.clock.now();
        let Some(record) = self.load_record()? else {
            return Ok(Diagnostics {
                state: AuthState::Unauthenticated,
                tenant_id: None,
                expires_at: None,
                expires_in_secs: None,
                has_refresh_token: false,
                refresh_token_age_secs: None,
                last_refresh_at: None,
                last_refresh_error: None,
                reauth_recommended: false,
            });
        };

        let refresh_token_age_secs = record
            .refresh_token
            .as_ref()
            .and_then(|_| record.refresh_token_age(now));
        let terminal_error = record
            .last_refresh_error
            .as_ref()
            .is_some_and(|e| e.kind == RefreshFailureKind::Terminal);
        let aging = refresh_token_age_secs.is_some_and(|age| {
            age >= self.policy.refresh_token_warn_age_secs
                || age >= self.policy.max_refresh_token_age_secs
        });

        Ok(Diagnostics {
            state: self.derive_state(&record, now),
            tenant_id: record.tenant_id.clone(),
            expires_at: record.has_access_token().then_some(record.expires_at),
            expires_in_secs: record
                .has_access_token()
                .then(|| record.expires_at - now),
            has_refresh_token: record.refresh_token.is_some(),
            refresh_token_age_secs,
            last_refresh_at: record.last_refresh_at,
            last_refresh_error: record.last_refresh_error.clone(),
            reauth_recommended: terminal_error || aging,
        })
    }

    /// Decides whether the record warrants a refresh right now.
    pub fn refresh_reason(&self, record: &CredentialRecord, now: i64) -> Option<RefreshReason> {
        if !record.has_access_token() || record.refresh_token.is_none() {
            return None;
        }
        // A rejected refresh token is only retried on explicit request
        if record
            .last_refresh_error
            .as_ref()
            .is_some_and(|e| e.kind == RefreshFailureKind::Terminal)
        {
            return None;
        }

        if record.is_expired(now) {
            return Some(RefreshReason::Expired);
        }
        if record.expires_at - now <= self.policy.refresh_window_secs {
            return Some(RefreshReason::NearExpiry);
        }
        // One attempt per aged token; a provider that does not rotate it would
        // otherwise be asked again on every check
        if let Some(crossed_at) = record
            .refresh_token_issued_at
            .map(|issued| issued.saturating_add(self.policy.max_refresh_token_age_secs))
        {
            let refreshed_since = record.last_refresh_at.is_some_and(|at| at >= crossed_at);
            if now >= crossed_at && !refreshed_since {
                return Some(RefreshReason::RefreshTokenAge);
            }
        }
        if record
            .since_last_refresh(now)
            .is_some_and(|since| since >= self.policy.keepalive_interval_secs)
        {
            return Some(RefreshReason::KeepAlive);
        }
        None
    }

    /// Refreshes when [`refresh_reason`](Self::refresh_reason) says so.
    ///
    /// Returns the reason a refresh ran, or `None` when nothing was due.
    pub async fn refresh_if_due(&self) -> Result<Option<RefreshReason>, AuthError> {
        let Some(record) = self.load_record()? else {
            return Ok(None);
        };
        let Some(reason) = self.refresh_reason(&record, self.clock.now()) else {
            return Ok(None);
        };

        debug!(reason = %reason, "Refresh due");
        self.refresh().await?;
        Ok(Some(reason))
    }

    /// Exchanges the stored refresh token for new tokens.
    ///
    /// Overlapping calls join the refresh already in flight. On failure the
    /// existing record is kept and `last_refresh_error` is recorded;
    /// `invalid_grant` / `unauthorized_client` come back as terminal.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        self.start_refresh().await.map_err(AuthError::from)
    }

    fn start_refresh(&self) -> SharedRefresh {
        let mut slot = self.in_flight_guard();
        if let Some(in_flight) = slot.as_ref() {
            debug!(refresh_id = in_flight.id, "Joining in-flight token refresh");
            return in_flight.future.clone();
        }

        let id = self.next_refresh_id.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        // Runs to completion even if every caller stops waiting
        let task = tokio::spawn(async move {
            let result = this.perform_refresh().await;
            this.finish_refresh(id);
            result
        });

        let future = async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshFailure::transient(format!(
                    "refresh task failed: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            future: future.clone(),
        });
        future
    }

    fn finish_refresh(&self, id: u64) {
        let mut slot = self.in_flight_guard();
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
    }

    fn spawn_background_refresh(&self, reason: RefreshReason) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(reason = %reason, "No async runtime, skipping background refresh");
            return;
        }
        debug!(reason = %reason, "Starting background token refresh");
        drop(self.start_refresh());
    }

    async fn perform_refresh(&self) -> Result<(), RefreshFailure> {
        let record = self
            .load_record()
            .map_err(|e| RefreshFailure::transient(e.to_string()))?
            .ok_or_else(|| RefreshFailure::terminal("no stored credentials"))?;
        let refresh_token = record.refresh_token.clone().ok_or_else(|| {
            RefreshFailure::terminal("no refresh token stored (offline access not granted)")
        })?;

        info!(
            tenant_id = record.tenant_id.as_deref().unwrap_or("-"),
            "Refreshing OAuth token"
        );

        let outcome = self.endpoint.exchange_refresh_token(&refresh_token).await;
        let now = self.clock.now();

        // Results for a refresh token that is no longer current (logout or a
        // newer login happened meanwhile) are discarded.
        let still_current = |current: &CredentialRecord| {
            current.refresh_token.as_deref() == Some(refresh_token.as_str())
        };

        match outcome {
            Ok(grant) => {
                let rotated = grant
                    .refresh_token
                    .as_deref()
                    .is_some_and(|r| r != refresh_token);

                let applied = self
                    .store
                    .modify(|current| {
                        still_current(current).then(|| current.with_refresh(&grant, now))
                    })
                    .map_err(|e| {
                        error!(error = %e, "Failed to persist refreshed credentials");
                        RefreshFailure::transient(format!(
                            "failed to persist refreshed credentials: {:#}",
                            e
                        ))
                    })?;

                match applied {
                    Some(updated) => {
                        info!(
                            expires_at = updated.expires_at,
                            rotated,
                            "OAuth token refreshed successfully"
                        );
                        if let Some(age) = updated
                            .refresh_token_age(now)
                            .filter(|age| *age >= self.policy.max_refresh_token_age_secs)
                        {
                            warn!(
                                age_secs = age,
                                "Provider did not rotate the aged refresh token, re-authentication recommended"
                            );
                        }
                    }
                    None => warn!("Credentials changed during refresh, discarding result"),
                }
                Ok(())
            }
            Err(e) => {
                let kind = if e.is_terminal_grant() {
                    RefreshFailureKind::Terminal
                } else {
                    RefreshFailureKind::Transient
                };

                match kind {
                    RefreshFailureKind::Terminal => error!(
                        error = %e,
                        "Refresh token rejected, re-authentication required"
                    ),
                    RefreshFailureKind::Transient => {
                        warn!(error = %e, "Token refresh failed, will retry")
                    }
                }

                let diagnostic = RefreshErrorInfo {
                    kind,
                    status: e.status(),
                    error_code: e.error_code().map(str::to_string),
                    message: e.to_string(),
                    at: now,
                };
                let recorded = self.store.modify(|current| {
                    still_current(current).then(|| {
                        let mut next = current.clone();
                        next.last_refresh_error = Some(diagnostic);
                        next
                    })
                });
                if let Err(store_err) = recorded {
                    warn!(error = %store_err, "Failed to record refresh error");
                }

                Err(RefreshFailure {
                    kind,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Exchanges an authorization code, discovers the tenant and persists the
    /// resulting record.
    pub async fn complete_authorization(
        &self,
        code: &str,
        preferred_tenant: Option<&str>,
    ) -> Result<CredentialRecord, AuthError> {
        let grant = self.endpoint.exchange_code(code).await?;
        let issued_at = self.clock.now();

        info!(
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = grant.expires_in,
            "Authorization code exchanged"
        );

        let resources = self
            .endpoint
            .accessible_resources(&grant.access_token)
            .await
            .map_err(|e| match e {
                ExchangeError::Network(msg) => AuthError::Network(msg),
                other => AuthError::TenantDiscoveryFailed(other.to_string()),
            })?;
        let tenant_id = select_tenant(&resources, preferred_tenant)?;

        let record = CredentialRecord::from_grant(&grant, tenant_id, issued_at);
        self.store.save(&record).map_err(AuthError::Storage)?;

        info!(
            tenant_id = record.tenant_id.as_deref().unwrap_or("-"),
            available_tenants = resources.len(),
            expires_at = record.expires_at,
            "Authentication complete"
        );
        Ok(record)
    }

    /// Deletes the credential record. Tokens are not revoked remotely.
    pub fn logout(&self) -> Result<bool, AuthError> {
        let removed = self.store.delete().map_err(AuthError::Storage)?;
        info!(removed, "Logged out");
        Ok(removed)
    }

    fn in_flight_guard(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
