//! OAuth provider endpoints and authorization URL construction.

use crate::config::OAuthConfig;

/// Provider endpoints plus the registered client.
#[derive(Clone, Debug)]
pub struct OAuthProvider {
    /// Browser-facing authorization endpoint
    pub auth_url: String,

    /// Token endpoint (code and refresh grants)
    pub token_url: String,

    /// Accessible-resources endpoint used for tenant discovery
    pub resources_url: String,

    pub audience: String,

    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,

    /// Must match the loopback listener address exactly
    pub redirect_uri: String,
}

impl OAuthProvider {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            resources_url: config.resources_url.clone(),
            audience: config.audience.clone(),
            scopes: config.scopes.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri(),
        }
    }

    /// Build authorization URL for the given CSRF state
    pub fn build_auth_url(&self, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?audience={}&client_id={}&scope={}&redirect_uri={}&state={}&response_type=code&prompt=consent",
            self.auth_url,
            encode_component(&self.audience),
            encode_component(&self.client_id),
            encode_component(&scopes),
            encode_component(&self.redirect_uri),
            encode_component(state)
        )
    }
}

/// Percent-encodes everything outside the unreserved set, rendering spaces
/// as `+` (form/query convention) instead of `%20`.
pub fn encode_component(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}
