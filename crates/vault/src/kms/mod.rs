//! Cloud key-management provider seam.
//!
//! Master keys live at the provider and never leave it; this crate only asks
//! the provider to create keys, wrap and unwrap data keys, enumerate keys,
//! read key policies and schedule deletion. Region selection is the caller's
//! job, and each call names its region explicitly.

pub mod memory;
pub mod policy;

pub use memory::InMemoryKms;
pub use policy::KeyPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by a [`KmsProvider`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KmsError {
    /// An alias or key with this identity already exists; another instance
    /// won the creation race.
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("key not found: {0}")]
    NotFound(String),

    /// The caller may not use the key, or the key is disabled.
    #[error("access to key denied: {0}")]
    AccessDenied(String),

    /// The ciphertext was not produced by this key, or was altered.
    #[error("invalid ciphertext for key {0}")]
    InvalidCiphertext(String),

    /// Transport or service failure.
    #[error("provider failure: {0}")]
    Provider(String),
}

/// Provider-side state of a master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterKeyState {
    Enabled,
    Disabled,
    PendingDeletion,
    /// The provider has no record of the key.
    Missing,
    /// Any other provider state (creating, importing, unavailable).
    Other,
}

impl MasterKeyState {
    /// Whether the key can still wrap and unwrap data keys.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// What the provider reports about one master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescription {
    pub state: MasterKeyState,
    /// Creation time, when the provider knows the key.
    pub created_at: Option<DateTime<Utc>>,
}

impl KeyDescription {
    pub fn missing() -> Self {
        Self {
            state: MasterKeyState::Missing,
            created_at: None,
        }
    }
}

/// Narrow interface to the cloud key-management service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Create a master key governed by `policy` and return its ARN.
    async fn create_key(
        &self,
        region: &str,
        policy: &KeyPolicy,
        alias: &str,
    ) -> Result<String, KmsError>;

    /// Wrap `plaintext` under `key_id`.
    async fn encrypt(
        &self,
        region: &str,
        key_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KmsError>;

    /// Unwrap a blob previously produced by [`KmsProvider::encrypt`].
    async fn decrypt(
        &self,
        region: &str,
        key_id: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KmsError>;

    /// ARNs of every master key visible in `region`.
    async fn list_keys(&self, region: &str) -> Result<Vec<String>, KmsError>;

    /// Raw JSON of the key's default policy.
    async fn get_key_policy(&self, region: &str, key_id: &str) -> Result<String, KmsError>;

    /// State and creation time of `key_id`; an unknown key is reported as
    /// [`MasterKeyState::Missing`], not as an error.
    async fn describe_key(&self, region: &str, key_id: &str)
        -> Result<KeyDescription, KmsError>;

    /// Schedule deletion of `key_id` after `pending_days`.
    async fn schedule_key_deletion(
        &self,
        region: &str,
        key_id: &str,
        pending_days: u32,
    ) -> Result<(), KmsError>;
}
