//! Domain records shared between the core and its collaborators.
//!
//! These mirror the persisted layout: safe deposit boxes, grants, secure data
//! (current state and append-only versions) and master-key metadata.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Roles and grants
// ---------------------------------------------------------------------------

/// Access level granted within one SDB.
///
/// Ordered so that `Owner > Write > Read`; a higher role implies every
/// permission of the lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Owner,
}

impl Role {
    /// Every role, lowest first.
    pub const ALL: [Role; 3] = [Role::Read, Role::Write, Role::Owner];

    /// Stable record id used by the persistence layer.
    pub fn id(&self) -> &'static str {
        match self {
            Role::Read => "f5c3b4a0-8d3f-4c7b-9a0e-1f2d3c4b5a61",
            Role::Write => "a7d9e2f1-3b4c-4d5e-8f6a-7b8c9d0e1f22",
            Role::Owner => "c1b2a3d4-e5f6-4a7b-8c9d-0e1f2a3b4c53",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Owner => "owner",
        }
    }

    /// Whether holding `self` satisfies a requirement of `required`.
    pub fn permits(&self, required: Role) -> bool {
        *self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Role::Read),
            "write" => Ok(Role::Write),
            "owner" => Ok(Role::Owner),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// Who a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum GrantSubject {
    /// A user group name as reported by the identity provider.
    UserGroup(String),
    /// An IAM role ARN or an account root ARN.
    IamPrincipal(String),
}

impl GrantSubject {
    pub fn name(&self) -> &str {
        match self {
            GrantSubject::UserGroup(name) | GrantSubject::IamPrincipal(name) => name,
        }
    }
}

/// Binds a [`GrantSubject`] to a [`Role`] within one SDB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalGrant {
    pub sdb_id: String,
    pub subject: GrantSubject,
    pub role: Role,
    pub created_ts: DateTime<Utc>,
    pub created_by: String,
}

// ---------------------------------------------------------------------------
// Safe deposit boxes
// ---------------------------------------------------------------------------

/// A namespace holding a related set of secrets.
///
/// `path` is derived from category and slug at creation and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeDepositBox {
    pub id: String,
    pub category: String,
    pub name: String,
    pub description: Option<String>,
    pub slug: String,
    pub path: String,
    pub owner_group: String,
    pub created_ts: DateTime<Utc>,
    pub created_by: String,
    pub last_updated_ts: DateTime<Utc>,
    pub last_updated_by: String,
}

// ---------------------------------------------------------------------------
// Secure data
// ---------------------------------------------------------------------------

/// Shape of a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecureDataType {
    /// A JSON object of key/value pairs.
    Object,
    /// An opaque file.
    File,
}

/// What happened to a secret when a version was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecureDataAction {
    Create,
    Update,
    Delete,
}

/// An encrypted envelope as stored.
///
/// Immutable once constructed: the bytes are copied in on construction and
/// only ever handed out as shared, read-only views.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob(Bytes);

impl EncryptedBlob {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Copy `bytes` into a new blob.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedBlob({} bytes)", self.0.len())
    }
}

/// Current state of one path inside one SDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureData {
    /// Storage key derived from the path; identity is `(sdb_id, path)`.
    pub id: u64,
    pub sdb_id: String,
    pub path: String,
    pub encrypted_blob: EncryptedBlob,
    pub data_type: SecureDataType,
    pub size_in_bytes: u64,
    /// Number of top-level keys; `None` for files.
    pub top_level_kv_count: Option<u32>,
    pub created_ts: DateTime<Utc>,
    pub created_by: String,
    pub last_updated_ts: DateTime<Utc>,
    pub last_updated_by: String,
    pub last_rotated_ts: DateTime<Utc>,
}

/// Immutable snapshot appended on every create, update and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureDataVersion {
    pub id: String,
    pub sdb_id: String,
    pub path: String,
    /// Blob written by the action; for deletes, the last blob before removal.
    pub encrypted_blob: EncryptedBlob,
    pub action: SecureDataAction,
    pub action_principal: String,
    pub action_ts: DateTime<Utc>,
    pub version_created_by: String,
    pub version_created_ts: DateTime<Utc>,
    pub data_type: SecureDataType,
    pub size_in_bytes: u64,
}

// ---------------------------------------------------------------------------
// Master keys
// ---------------------------------------------------------------------------

/// Metadata for one provider-side master key, unique per `(scope, region)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub id: String,
    pub scope: String,
    pub region: String,
    /// Provider key ARN.
    pub key_id: String,
    pub created_ts: DateTime<Utc>,
    pub created_by: String,
    pub last_updated_ts: DateTime<Utc>,
    pub last_updated_by: String,
    pub last_validated_ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

/// One page of a larger result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    /// Whether more items exist after this page.
    pub fn has_next(&self) -> bool {
        ((self.offset + self.items.len()) as u64) < self.total
    }

    /// Offset of the next page, if any.
    pub fn next_offset(&self) -> Option<usize> {
        self.has_next().then(|| self.offset + self.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::Owner > Role::Write);
        assert!(Role::Write > Role::Read);
        assert!(Role::Owner.permits(Role::Read));
        assert!(Role::Write.permits(Role::Write));
        assert!(!Role::Read.permits(Role::Write));
        assert_eq!(Role::ALL.iter().max(), Some(&Role::Owner));
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!("OWNER".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("read".parse::<Role>().unwrap(), Role::Read);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn role_ids_are_distinct() {
        assert_ne!(Role::Read.id(), Role::Write.id());
        assert_ne!(Role::Write.id(), Role::Owner.id());
    }

    #[test]
    fn grant_subject_serde() {
        let subject = GrantSubject::UserGroup("eng".into());
        let json = serde_json::to_string(&subject).unwrap();
        assert_eq!(json, r#"{"kind":"user_group","name":"eng"}"#);
        let decoded: GrantSubject = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, subject);
    }

    #[test]
    fn blob_debug_hides_content() {
        let blob = EncryptedBlob::copy_from_slice(b"v1.secret");
        assert_eq!(format!("{blob:?}"), "EncryptedBlob(9 bytes)");
    }

    #[test]
    fn page_next_offset() {
        let page = Page {
            items: vec![1, 2],
            total: 5,
            limit: 2,
            offset: 2,
        };
        assert!(page.has_next());
        assert_eq!(page.next_offset(), Some(4));

        let last = Page {
            items: vec![5],
            total: 5,
            limit: 2,
            offset: 4,
        };
        assert!(!last.has_next());
        assert_eq!(last.next_offset(), None);
    }
}
