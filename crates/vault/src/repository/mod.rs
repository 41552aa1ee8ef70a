//! Persistence collaborator interfaces.
//!
//! The core never talks to a database directly. Each trait here is one
//! narrow slice of the relational store; every call is expected to be
//! transactional on its own, and transient failures are retried by the
//! implementation, not by the core.

pub mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    EncryptedBlob, GrantSubject, KeyMetadata, PrincipalGrant, Role, SafeDepositBox, SecureData,
    SecureDataType, SecureDataVersion,
};
use thiserror::Error;

/// Errors surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store failed; the implementation has already retried.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Path, type and size of a stored secret, without its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureDataSummary {
    pub path: String,
    pub data_type: SecureDataType,
    pub size_in_bytes: u64,
}

/// An issued authentication token, tracked only so expired ones can be purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub id: String,
    pub principal: String,
    pub created_ts: DateTime<Utc>,
    pub expires_ts: DateTime<Utc>,
}

/// Role grants per SDB.
#[async_trait]
pub trait PermissionRepository: Send + Sync {
    /// Role granted directly to an IAM principal ARN (role or account root).
    async fn get_grant(
        &self,
        principal_key: &str,
        sdb_id: &str,
    ) -> Result<Option<Role>, RepositoryError>;

    /// Roles granted to any of `groups`, matched exactly.
    async fn get_group_grants(
        &self,
        groups: &[String],
        sdb_id: &str,
    ) -> Result<Vec<Role>, RepositoryError>;

    /// Roles granted to any of `groups`, ignoring ASCII case.
    async fn get_group_grants_ignoring_case(
        &self,
        groups: &[String],
        sdb_id: &str,
    ) -> Result<Vec<Role>, RepositoryError>;

    async fn list_grants(&self, sdb_id: &str) -> Result<Vec<PrincipalGrant>, RepositoryError>;

    /// Record `grant` next to any the subject already holds in the SDB.
    /// A subject may hold several roles; resolution takes the highest.
    async fn add_grant(&self, grant: PrincipalGrant) -> Result<(), RepositoryError>;

    /// Replace every grant of `(grant.sdb_id, grant.subject)` with `grant`.
    async fn put_grant(&self, grant: PrincipalGrant) -> Result<(), RepositoryError>;

    async fn delete_grant(
        &self,
        sdb_id: &str,
        subject: &GrantSubject,
    ) -> Result<bool, RepositoryError>;

    async fn delete_grants_for_sdb(&self, sdb_id: &str) -> Result<usize, RepositoryError>;
}

/// Safe deposit box records.
#[async_trait]
pub trait SdbRepository: Send + Sync {
    /// Insert a new SDB; fails with [`RepositoryError::Conflict`] on a duplicate
    /// id, path or slug.
    async fn insert_sdb(&self, sdb: SafeDepositBox) -> Result<(), RepositoryError>;

    async fn get_sdb(&self, sdb_id: &str) -> Result<Option<SafeDepositBox>, RepositoryError>;

    async fn list_sdbs(&self) -> Result<Vec<SafeDepositBox>, RepositoryError>;

    async fn delete_sdb(&self, sdb_id: &str) -> Result<bool, RepositoryError>;
}

/// Current secure data records and their version history.
#[async_trait]
pub trait SecureDataRepository: Send + Sync {
    async fn get_secure_data(
        &self,
        sdb_id: &str,
        path: &str,
    ) -> Result<Option<SecureData>, RepositoryError>;

    /// Insert or replace the current record for `(record.sdb_id, record.path)`.
    async fn upsert_secure_data(&self, record: SecureData) -> Result<(), RepositoryError>;

    async fn delete_secure_data(&self, sdb_id: &str, path: &str) -> Result<bool, RepositoryError>;

    /// Replace the blob of a record only if it still holds `expected`.
    ///
    /// Returns `false` when the record changed or vanished in the meantime.
    async fn replace_blob_if_unchanged(
        &self,
        sdb_id: &str,
        path: &str,
        expected: &EncryptedBlob,
        replacement: EncryptedBlob,
        rotated_ts: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Paths under `prefix`, optionally restricted to one payload type, sorted.
    async fn list_summaries(
        &self,
        sdb_id: &str,
        prefix: &str,
        data_type: Option<SecureDataType>,
    ) -> Result<Vec<SecureDataSummary>, RepositoryError>;

    /// Up to `limit` records last rotated before `cutoff`, oldest first.
    async fn list_rotated_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecureData>, RepositoryError>;

    async fn delete_all_secure_data(&self, sdb_id: &str) -> Result<usize, RepositoryError>;

    async fn insert_version(&self, version: SecureDataVersion) -> Result<(), RepositoryError>;

    /// Versions of one path in the order they were appended.
    async fn list_versions(
        &self,
        sdb_id: &str,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SecureDataVersion>, RepositoryError>;

    async fn count_versions(&self, sdb_id: &str, path: &str) -> Result<u64, RepositoryError>;

    async fn get_version(
        &self,
        sdb_id: &str,
        version_id: &str,
    ) -> Result<Option<SecureDataVersion>, RepositoryError>;

    async fn delete_all_versions(&self, sdb_id: &str) -> Result<usize, RepositoryError>;
}

/// Master-key metadata, unique per `(scope, region)`.
#[async_trait]
pub trait KeyMetadataRepository: Send + Sync {
    async fn get_key_metadata(
        &self,
        scope: &str,
        region: &str,
    ) -> Result<Option<KeyMetadata>, RepositoryError>;

    /// Insert metadata for a newly created key; fails with
    /// [`RepositoryError::Conflict`] if the `(scope, region)` row already exists.
    async fn insert_key_metadata(&self, metadata: KeyMetadata) -> Result<(), RepositoryError>;

    /// Overwrite the `(scope, region)` row only while it still names
    /// `metadata.key_id`. Returns `false` when the row is gone or was replaced.
    async fn update_key_metadata(&self, metadata: KeyMetadata) -> Result<bool, RepositoryError>;

    async fn delete_key_metadata(&self, scope: &str, region: &str)
        -> Result<bool, RepositoryError>;

    /// Delete the `(scope, region)` row only while it still names `key_id`.
    ///
    /// Returns `false` when the row is gone or now tracks another key.
    async fn delete_key_metadata_if_current(
        &self,
        scope: &str,
        region: &str,
        key_id: &str,
    ) -> Result<bool, RepositoryError>;

    /// All rows, optionally restricted to one region.
    async fn list_key_metadata(
        &self,
        region: Option<&str>,
    ) -> Result<Vec<KeyMetadata>, RepositoryError>;
}

/// Authentication tokens.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Delete at most `limit` tokens that expired before `now`; returns the count.
    async fn delete_expired_tokens(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, RepositoryError>;
}
