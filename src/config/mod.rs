use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete worklog-auth configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// OAuth client and provider endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Accessible-resources (tenant discovery) endpoint
    #[serde(default = "default_resources_url")]
    pub resources_url: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    /// How long the authenticate flow waits for the browser redirect (seconds)
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    /// Timeout applied to every token/discovery/API request (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Preferred tenant when the account can reach several
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_auth_url() -> String {
    "https://auth.atlassian.com/authorize".to_string()
}

fn default_token_url() -> String {
    "https://auth.atlassian.com/oauth/token".to_string()
}

fn default_resources_url() -> String {
    "https://api.atlassian.com/oauth/token/accessible-resources".to_string()
}

fn default_audience() -> String {
    "api.atlassian.com".to_string()
}

fn default_scopes() -> Vec<String> {
    ["read:jira-work", "write:jira-work", "read:jira-user", "offline_access"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_callback_port() -> u16 {
    8080
}

fn default_callback_path() -> String {
    "/callback".to_string()
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            resources_url: default_resources_url(),
            audience: default_audience(),
            scopes: default_scopes(),
            callback_port: default_callback_port(),
            callback_path: default_callback_path(),
            callback_timeout_secs: default_callback_timeout(),
            http_timeout_secs: default_http_timeout(),
            tenant_id: None,
        }
    }
}

impl OAuthConfig {
    /// Redirect URI registered with the provider
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.callback_port, self.callback_path)
    }
}

/// Credential file location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

fn default_credentials_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home)
            .join(".config")
            .join("worklog")
            .join("credentials.json"),
        None => PathBuf::from("worklog-credentials.json"),
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

/// Proactive refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh in the background once the access token is this close to expiry (seconds)
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
    /// Refresh regardless of expiry once the refresh token is this old (seconds)
    #[serde(default = "default_max_refresh_token_age")]
    pub max_refresh_token_age_secs: i64,
    /// Refresh at least this often to keep the refresh token alive (seconds)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: i64,
    /// Warn about re-authentication once the refresh token is this old (seconds)
    #[serde(default = "default_refresh_token_warn_age")]
    pub refresh_token_warn_age_secs: i64,
    /// Background scheduler tick (seconds)
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
}

const DAY_SECS: i64 = 24 * 60 * 60;

fn default_refresh_window() -> i64 {
    300
}

fn default_max_refresh_token_age() -> i64 {
    80 * DAY_SECS
}

fn default_keepalive_interval() -> i64 {
    DAY_SECS
}

fn default_refresh_token_warn_age() -> i64 {
    85 * DAY_SECS
}

fn default_scheduler_interval() -> u64 {
    600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_window_secs: default_refresh_window(),
            max_refresh_token_age_secs: default_max_refresh_token_age(),
            keepalive_interval_secs: default_keepalive_interval(),
            refresh_token_warn_age_secs: default_refresh_token_warn_age(),
            scheduler_interval_secs: default_scheduler_interval(),
        }
    }
}

/// Backend API addressing
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL; the tenant id and request path are appended
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
}

fn default_gateway_url() -> String {
    "https://api.atlassian.com/ex/jira".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
        }
    }
}

impl AuthConfig {
    /// Apply `WORKLOG_*` environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORKLOG_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup("WORKLOG_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = lookup("WORKLOG_CALLBACK_PORT") {
            self.oauth.callback_port = v
                .parse()
                .context("WORKLOG_CALLBACK_PORT must be a valid port number")?;
        }
        if let Some(v) = lookup("WORKLOG_CREDENTIALS_PATH") {
            self.storage.credentials_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WORKLOG_TENANT_ID") {
            self.oauth.tenant_id = Some(v);
        }
        Ok(())
    }

    /// Reject configurations the OAuth flow cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() {
            bail!("oauth.client_id is required (or set WORKLOG_CLIENT_ID)");
        }
        if self.oauth.client_secret.is_empty() {
            bail!("oauth.client_secret is required (or set WORKLOG_CLIENT_SECRET)");
        }
        if self.oauth.http_timeout_secs == 0 {
            bail!("oauth.http_timeout_secs must be greater than zero");
        }
        if self.refresh.scheduler_interval_secs == 0 {
            bail!("refresh.scheduler_interval_secs must be greater than zero");
        }
        if self.refresh.refresh_window_secs < 0 {
            bail!("refresh.refresh_window_secs must not be negative");
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AuthConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AuthConfig = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
