// Configuration (TOML + environment)
pub mod config;

// Injected time source
pub mod clock;

// Error taxonomy
pub mod error;

// Credential record and file store
pub mod credentials;

// Authorization flow, token exchange, redirect listener
pub mod oauth;

// Token lifecycle state machine
pub mod lifecycle;

// Background proactive refresh
pub mod scheduler;

// Authenticated API requests
pub mod api;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::ApiClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, AuthConfig};
pub use credentials::{CredentialRecord, CredentialStore};
pub use error::{AuthError, ExchangeError, RefreshFailureKind};
pub use lifecycle::{AuthState, Diagnostics, LifecycleManager, RefreshPolicy, RefreshReason};
pub use oauth::{AuthorizationPrompt, Authenticator};
pub use scheduler::RefreshScheduler;
