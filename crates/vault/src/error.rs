//! Crate-level error type and its mapping onto the caller-facing taxonomy.

use common::ServiceError;
use thiserror::Error;

use crate::arn::ArnError;
use crate::crypto::EncryptionError;
use crate::kms::KmsError;
use crate::repository::RepositoryError;

/// Every failure the core can surface, classified by how callers react to it.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed or unrecognised identity; rejected before any other work.
    #[error(transparent)]
    Identity(#[from] ArnError),

    /// The principal resolved but holds no sufficient role.
    #[error("{principal} may not access sdb {sdb_id}")]
    AccessDenied { principal: String, sdb_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// The repository failed after its own retries.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl VaultError {
    /// Only storage failures are worth retrying; everything else fails the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Storage(_))
    }
}

impl From<RepositoryError> for VaultError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(what) => VaultError::Conflict(what),
            RepositoryError::Backend(reason) => VaultError::Storage(reason),
        }
    }
}

impl From<KmsError> for VaultError {
    fn from(err: KmsError) -> Self {
        VaultError::Encryption(EncryptionError::Provider(err.to_string()))
    }
}

impl From<VaultError> for ServiceError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Identity(e) => ServiceError::InvalidIdentity(e.to_string()),
            VaultError::AccessDenied { .. } | VaultError::NotFound(_) => {
                ServiceError::NotAccessible
            }
            VaultError::InvalidRequest(reason) => ServiceError::BadRequest(reason),
            VaultError::Conflict(what) => ServiceError::Conflict(what),
            VaultError::Encryption(_) => ServiceError::EncryptionFailure,
            VaultError::Storage(reason) => ServiceError::Unavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_and_absence_look_the_same() {
        let denied: ServiceError = VaultError::AccessDenied {
            principal: "arn:aws:iam::1:role/x".into(),
            sdb_id: "abc".into(),
        }
        .into();
        let missing: ServiceError = VaultError::NotFound("abc/db/creds".into()).into();
        assert_eq!(denied.to_string(), missing.to_string());
        assert_eq!(denied.http_status(), 404);
        assert_eq!(missing.http_status(), 404);
    }

    #[test]
    fn encryption_detail_is_hidden() {
        let err: ServiceError = VaultError::Encryption(EncryptionError::MasterKeyUnavailable {
            key_id: "arn:aws:kms:us-west-2:1:key/k".into(),
            region: "us-west-2".into(),
            reason: "disabled".into(),
        })
        .into();
        assert_eq!(err.http_status(), 500);
        assert!(!err.to_string().contains("key/k"));
    }

    #[test]
    fn only_storage_is_retryable() {
        assert!(VaultError::from(RepositoryError::Backend("timeout".into())).is_retryable());
        assert!(!VaultError::from(RepositoryError::Conflict("slug".into())).is_retryable());
        assert!(!VaultError::InvalidRequest("bad path".into()).is_retryable());
        assert!(!VaultError::from(KmsError::NotFound("k".into())).is_retryable());
    }

    #[test]
    fn identity_maps_to_bad_identity() {
        let err: ServiceError =
            VaultError::Identity(ArnError::Unrecognized("nope".into())).into();
        assert_eq!(err.code(), "invalid_identity");
    }
}
