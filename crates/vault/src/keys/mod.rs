//! Key-lifecycle management: envelope encryption under lazily provisioned
//! master keys, data-key rotation, deletion scheduling and reconciliation of
//! master keys the metadata table no longer knows about.
//!
//! # Invariants
//!
//! - One fresh data key per encrypt call.
//! - At most one tracked master key per `(scope, region)`.
//! - Master keys are only ever deleted through the provider's pending window,
//!   never below [`MIN_DELETION_GRACE_DAYS`].

pub mod cache;
pub mod manager;
mod reconcile;
mod rotation;

pub use cache::KeyMetadataCache;
pub use manager::KeyLifecycleManager;

use std::fmt;

use sha2::{Digest, Sha256};

/// Lower bound of the provider-side deletion window.
pub const MIN_DELETION_GRACE_DAYS: u32 = 7;
/// Upper bound of the provider-side deletion window.
pub const MAX_DELETION_GRACE_DAYS: u32 = 30;

/// Actor recorded on key metadata rows written by the manager.
pub const SYSTEM_ACTOR: &str = "sdb-vault";

/// Who a master key belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// Dedicated key for one SDB's secure data.
    Sdb(String),
    /// Key for material handed to one IAM principal.
    Principal(String),
}

impl KeyScope {
    /// Parse the stored form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(id) = s.strip_prefix("sdb:") {
            return Some(Self::Sdb(id.to_owned()));
        }
        s.strip_prefix("principal:")
            .map(|arn| Self::Principal(arn.to_owned()))
    }

    pub fn is_principal(&self) -> bool {
        matches!(self, Self::Principal(_))
    }

    /// Provider alias for this scope's key in `environment`.
    ///
    /// Scope strings may hold characters aliases do not allow, so the alias
    /// carries a digest instead.
    pub fn alias(&self, environment: &str) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let hex: String = digest[..12].iter().map(|b| format!("{b:02x}")).collect();
        format!("alias/sdb-vault/{environment}/{hex}")
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sdb(id) => write!(f, "sdb:{id}"),
            Self::Principal(arn) => write!(f, "principal:{arn}"),
        }
    }
}

/// Encryption context binding a secure data blob to its record.
pub fn secure_data_context(sdb_id: &str, path: &str) -> String {
    format!("{sdb_id}/{path}")
}

/// Clamp a requested deletion window into the allowed range.
pub fn clamp_grace_days(days: u32) -> u32 {
    days.clamp(MIN_DELETION_GRACE_DAYS, MAX_DELETION_GRACE_DAYS)
}

/// Static settings of a [`KeyLifecycleManager`].
#[derive(Debug, Clone)]
pub struct KeySettings {
    pub environment: String,
    pub service_role_arn: String,
    pub account_root_arn: String,
    /// Encryption regions; the first is primary.
    pub regions: Vec<String>,
    /// How stale `last_validated_ts` may get before the provider is asked again.
    pub validation_interval: chrono::Duration,
    pub deletion_grace_days: u32,
}

impl KeySettings {
    pub fn primary_region(&self) -> Option<&str> {
        self.regions.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_string_round_trip() {
        for scope in [
            KeyScope::Sdb("0f1e".into()),
            KeyScope::Principal("arn:aws:iam::1:role/app".into()),
        ] {
            assert_eq!(KeyScope::parse(&scope.to_string()), Some(scope));
        }
        assert_eq!(KeyScope::parse("token:abc"), None);
    }

    #[test]
    fn alias_is_stable_and_safe() {
        let scope = KeyScope::Principal("arn:aws:iam::1:role/path/app".into());
        let alias = scope.alias("prod");
        assert_eq!(alias, scope.alias("prod"));
        assert_ne!(alias, scope.alias("dev"));
        assert!(alias
            .trim_start_matches("alias/")
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '-'));
    }

    #[test]
    fn grace_days_clamped() {
        assert_eq!(clamp_grace_days(0), 7);
        assert_eq!(clamp_grace_days(14), 14);
        assert_eq!(clamp_grace_days(365), 30);
    }

    #[test]
    fn context_joins_sdb_and_path() {
        assert_eq!(secure_data_context("abc", "db/creds"), "abc/db/creds");
    }
}
