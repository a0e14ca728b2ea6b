//! In-memory provider and fixtures shared by unit tests.

use crate::clock::ManualClock;
use crate::credentials::{CredentialRecord, CredentialStore, SCHEMA_VERSION};
use crate::error::ExchangeError;
use crate::lifecycle::{LifecycleManager, RefreshPolicy};
use crate::oauth::{AccessibleResource, TokenEndpoint, TokenResponse};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub const T0: i64 = 1_700_000_000;

pub fn grant(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResponse {
    TokenResponse {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_in,
        scope: None,
    }
}

pub fn resource(id: &str) -> AccessibleResource {
    AccessibleResource {
        id: id.to_string(),
        name: None,
        url: None,
        scopes: vec![],
    }
}

/// A complete record issued at `issued_at`.
pub fn record(access: &str, refresh: Option<&str>, expires_at: i64, issued_at: i64) -> CredentialRecord {
    CredentialRecord {
        access_token: Some(access.to_string()),
        refresh_token: refresh.map(str::to_string),
        expires_at,
        tenant_id: Some("cloud-9".to_string()),
        refresh_token_issued_at: Some(issued_at),
        last_refresh_at: Some(issued_at),
        last_refresh_error: None,
        schema_version: SCHEMA_VERSION,
    }
}

/// Scripted [`TokenEndpoint`].
///
/// Refresh results are served in order; once the script runs out every
/// refresh fails with a 503. With a gate set, each refresh parks until the
/// gate is notified.
#[derive(Default)]
pub struct FakeEndpoint {
    code_result: Mutex<Option<Result<TokenResponse, ExchangeError>>>,
    refresh_results: Mutex<VecDeque<Result<TokenResponse, ExchangeError>>>,
    resources: Mutex<Option<Result<Vec<AccessibleResource>, ExchangeError>>>,
    refresh_calls: AtomicUsize,
    code_calls: AtomicUsize,
    seen_refresh_tokens: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn push_refresh(&self, result: Result<TokenResponse, ExchangeError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    pub fn set_code_result(&self, result: Result<TokenResponse, ExchangeError>) {
        *self.code_result.lock().unwrap() = Some(result);
    }

    pub fn set_resources(&self, result: Result<Vec<AccessibleResource>, ExchangeError>) {
        *self.resources.lock().unwrap() = Some(result);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn code_calls(&self) -> usize {
        self.code_calls.load(Ordering::SeqCst)
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenEndpoint for FakeEndpoint {
    async fn exchange_code(&self, _code: &str) -> Result<TokenResponse, ExchangeError> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.code_result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(ExchangeError::Network("no code result scripted".into())))
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, ExchangeError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_refresh_tokens
            .lock()
            .unwrap()
            .push(refresh_token.to_string());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let next = self.refresh_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(ExchangeError::Status {
                status: 503,
                error_code: None,
                body: "script exhausted".into(),
            })
        })
    }

    async fn accessible_resources(
        &self,
        _access_token: &str,
    ) -> Result<Vec<AccessibleResource>, ExchangeError> {
        self.resources
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(vec![resource("cloud-9")]))
    }
}

/// Manager over a temp-dir store, a manual clock at [`T0`] and `endpoint`.
pub struct Harness {
    pub manager: LifecycleManager,
    pub endpoint: Arc<FakeEndpoint>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<CredentialStore>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_endpoint(FakeEndpoint::new())
    }

    pub fn with_endpoint(endpoint: FakeEndpoint) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
        let endpoint = Arc::new(endpoint);
        let clock = Arc::new(ManualClock::new(T0));
        let manager = LifecycleManager::new(
            store.clone(),
            endpoint.clone(),
            clock.clone(),
            RefreshPolicy::default(),
        );

        Self {
            manager,
            endpoint,
            clock,
            store,
            _dir: dir,
        }
    }

    pub fn seed(&self, record: &CredentialRecord) {
        self.store.save(record).unwrap();
    }

    pub fn stored(&self) -> Option<CredentialRecord> {
        self.store.load().unwrap()
    }
}
