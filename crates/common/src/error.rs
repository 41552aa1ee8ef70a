//! Caller-facing error taxonomy shared across crates.

use thiserror::Error;

/// Message returned for both "no such resource" and "not allowed".
///
/// The two cases are deliberately indistinguishable to callers so that a
/// principal without access cannot probe which SDBs or paths exist.
pub const NOT_ACCESSIBLE_MESSAGE: &str = "the requested resource does not exist or access is denied";

/// Top-level service error type.
///
/// Variants map to HTTP status codes returned to callers:
/// - [`ServiceError::BadRequest`] → 400
/// - [`ServiceError::InvalidIdentity`] → 400
/// - [`ServiceError::NotAccessible`] → 404
/// - [`ServiceError::Conflict`] → 409
/// - [`ServiceError::EncryptionFailure`] → 500
/// - [`ServiceError::Unavailable`] → 503
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed: bad path, non-object JSON payload, invalid grant.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller's identity string could not be parsed or belongs to another partition.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// The resource does not exist, or the caller lacks the role to see it.
    #[error("{NOT_ACCESSIBLE_MESSAGE}")]
    NotAccessible,

    /// A uniqueness constraint was violated (duplicate SDB name or path).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Encryption or decryption failed. Detail stays in server-side logs.
    #[error("encryption failure")]
    EncryptionFailure,

    /// A backing store or key provider is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::InvalidIdentity(_) => 400,
            ServiceError::NotAccessible => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::EncryptionFailure => 500,
            ServiceError::Unavailable(_) => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code (e.g. `"bad_request"`).
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::InvalidIdentity(_) => "invalid_identity",
            ServiceError::NotAccessible => "not_accessible",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::EncryptionFailure => "encryption_failure",
            ServiceError::Unavailable(_) => "service_unavailable",
            ServiceError::Internal(_) => "internal_error",
        }
    }
}
