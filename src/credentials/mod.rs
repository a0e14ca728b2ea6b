//! Persisted OAuth credential state.
//!
//! One [`CredentialRecord`] exists per installation. It is written as a single
//! JSON document and replaced wholesale on every save, so a reader never sees
//! an access token paired with another response's metadata.
//!
//! ```text
//! {
//!   "access_token": "...",
//!   "refresh_token": "...",
//!   "expires_at": 1700003600,
//!   "tenant_id": "cloud-9",
//!   "refresh_token_issued_at": 1700000000,
//!   "last_refresh_at": 1700000000,
//!   "last_refresh_error": null,
//!   "schema_version": 1
//! }
//! ```
//!
//! Records written before lifecycle timestamps existed are upgraded on read by
//! [`migrate`].

use crate::error::RefreshFailureKind;
use crate::oauth::TokenResponse;
use serde::{Deserialize, Serialize};

mod storage;

pub use storage::CredentialStore;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// The singleton credential record.
///
/// All timestamps are seconds since the Unix epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Bearer token for API calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Absent when the consent omitted offline access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Derived as issuance time + provider TTL, never taken from elsewhere
    #[serde(default)]
    pub expires_at: i64,

    /// Cloud/resource id the tokens are scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_issued_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<i64>,

    /// Informational only; never blocks a later attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_error: Option<RefreshErrorInfo>,

    #[serde(default)]
    pub schema_version: u32,
}

/// Diagnostic left behind by the most recent failed refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshErrorInfo {
    pub kind: RefreshFailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
    pub at: i64,
}

impl CredentialRecord {
    /// Builds a fresh record from an authorization-code grant.
    pub fn from_grant(grant: &TokenResponse, tenant_id: String, now: i64) -> Self {
        Self {
            access_token: Some(grant.access_token.clone()),
            refresh_token: grant.refresh_token.clone(),
            expires_at: now.saturating_add(grant.expires_in),
            tenant_id: Some(tenant_id),
            refresh_token_issued_at: Some(now),
            last_refresh_at: Some(now),
            last_refresh_error: None,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Returns a copy with a refresh grant applied.
    ///
    /// The refresh token is only replaced (and its issuance time reset) when
    /// the provider rotated it.
    pub fn with_refresh(&self, grant: &TokenResponse, now: i64) -> Self {
        let mut next = self.clone();
        next.access_token = Some(grant.access_token.clone());
        next.expires_at = now.saturating_add(grant.expires_in);
        next.last_refresh_at = Some(now);
        next.last_refresh_error = None;

        if let Some(rotated) = &grant.refresh_token {
            if next.refresh_token.as_deref() != Some(rotated.as_str()) {
                next.refresh_token = Some(rotated.clone());
                next.refresh_token_issued_at = Some(now);
            }
        }

        next
    }

    /// Access token present and non-empty
    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Token present, unexpired, and the tenant is known.
    pub fn is_usable(&self, now: i64) -> bool {
        self.has_access_token() && !self.is_expired(now) && self.tenant_id.is_some()
    }

    /// Seconds since the current refresh token was minted
    pub fn refresh_token_age(&self, now: i64) -> Option<i64> {
        self.refresh_token_issued_at.map(|issued| now - issued)
    }

    /// Seconds since the last successful refresh
    pub fn since_last_refresh(&self, now: i64) -> Option<i64> {
        self.last_refresh_at.map(|at| now - at)
    }
}

/// Upgrades a persisted record to [`SCHEMA_VERSION`].
///
/// Missing lifecycle timestamps are backfilled with `now` so age-based
/// refresh decisions behave the same on the first read after an upgrade.
/// Re-running on a migrated record returns it unchanged, and records from a
/// newer schema are never downgraded.
pub fn migrate(mut record: CredentialRecord, now: i64) -> CredentialRecord {
    if record.schema_version >= SCHEMA_VERSION {
        return record;
    }

    record.refresh_token_issued_at.get_or_insert(now);
    record.last_refresh_at.get_or_insert(now);
    record.schema_version = SCHEMA_VERSION;
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(access: &str, refresh: Option<&str>, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: refresh.map(|r| r.to_string()),
            expires_in,
            scope: None,
        }
    }

    #[test]
    fn test_from_grant_derives_expiry() {
        let record = CredentialRecord::from_grant(
            &grant("T1", Some("R1"), 3600),
            "cloud-9".to_string(),
            1000,
        );
        assert_eq!(record.expires_at, 4600);
        assert_eq!(record.access_token.as_deref(), Some("T1"));
        assert_eq!(record.refresh_token.as_deref(), Some("R1"));
        assert_eq!(record.tenant_id.as_deref(), Some("cloud-9"));
        assert_eq!(record.refresh_token_issued_at, Some(1000));
        assert_eq!(record.last_refresh_at, Some(1000));
        assert_eq!(record.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let record = CredentialRecord::from_grant(
            &grant("T1", None, i64::MAX),
            "cloud-9".to_string(),
            1000,
        );
        assert_eq!(record.expires_at, i64::MAX);
        assert!(!record.is_expired(1000));

        let refreshed = record.with_refresh(&grant("T2", None, i64::MAX), 2000);
        assert_eq!(refreshed.expires_at, i64::MAX);
    }

    #[test]
    fn test_with_refresh_keeps_unrotated_refresh_token() {
        let record =
            CredentialRecord::from_grant(&grant("T1", Some("R1"), 3600), "c".to_string(), 1000);

        let next = record.with_refresh(&grant("T2", None, 3600), 5000);
        assert_eq!(next.access_token.as_deref(), Some("T2"));
        assert_eq!(next.refresh_token.as_deref(), Some("R1"));
        assert_eq!(next.refresh_token_issued_at, Some(1000));
        assert_eq!(next.last_refresh_at, Some(5000));
        assert_eq!(next.expires_at, 8600);

        // Same value echoed back is not a rotation
        let next = record.with_refresh(&grant("T2", Some("R1"), 3600), 5000);
        assert_eq!(next.refresh_token_issued_at, Some(1000));
    }

    #[test]
    fn test_with_refresh_rotates_refresh_token() {
        let mut record =
            CredentialRecord::from_grant(&grant("T1", Some("R1"), 3600), "c".to_string(), 1000);
        record.last_refresh_error = Some(RefreshErrorInfo {
            kind: RefreshFailureKind::Transient,
            status: Some(503),
            error_code: None,
            message: "unavailable".to_string(),
            at: 4000,
        });

        let next = record.with_refresh(&grant("T2", Some("R2"), 60), 5000);
        assert_eq!(next.refresh_token.as_deref(), Some("R2"));
        assert_eq!(next.refresh_token_issued_at, Some(5000));
        assert!(next.last_refresh_error.is_none());
    }

    #[test]
    fn test_usable_requires_tenant() {
        let mut record =
            CredentialRecord::from_grant(&grant("T1", None, 3600), "c".to_string(), 1000);
        assert!(record.is_usable(2000));
        assert!(!record.is_usable(4600));

        record.tenant_id = None;
        assert!(!record.is_usable(2000));
    }

    #[test]
    fn test_empty_access_token_is_not_a_token() {
        let record = CredentialRecord {
            access_token: Some(String::new()),
            expires_at: i64::MAX,
            tenant_id: Some("c".to_string()),
            ..Default::default()
        };
        assert!(!record.has_access_token());
        assert!(!record.is_usable(0));
    }

    #[test]
    fn test_migrate_backfills_and_is_idempotent() {
        let legacy: CredentialRecord = serde_json::from_str(
            r#"{"access_token":"T","refresh_token":"R","expires_at":5000,"tenant_id":"c"}"#,
        )
        .unwrap();
        assert_eq!(legacy.schema_version, 0);

        let migrated = migrate(legacy, 1234);
        assert_eq!(migrated.schema_version, 1);
        assert_eq!(migrated.refresh_token_issued_at, Some(1234));
        assert_eq!(migrated.last_refresh_at, Some(1234));

        let again = migrate(migrated.clone(), 9999);
        assert_eq!(again, migrated);
    }

    #[test]
    fn test_migrate_keeps_existing_timestamps() {
        let legacy = CredentialRecord {
            access_token: Some("T".to_string()),
            last_refresh_at: Some(10),
            ..Default::default()
        };

        let migrated = migrate(legacy, 1234);
        assert_eq!(migrated.last_refresh_at, Some(10));
        assert_eq!(migrated.refresh_token_issued_at, Some(1234));
    }

    #[test]
    fn test_migrate_never_downgrades() {
        let future = CredentialRecord {
            schema_version: 7,
            ..Default::default()
        };
        let migrated = migrate(future.clone(), 1234);
        assert_eq!(migrated, future);
    }
}
