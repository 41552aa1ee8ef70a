//! [`MemoryRepository`]: in-process implementation of every repository trait.
//!
//! Backs unit tests and the single-node worker. One `RwLock` guards all
//! tables, so each trait call is atomic like a single-statement transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    EncryptedBlob, GrantSubject, KeyMetadata, PrincipalGrant, Role, SafeDepositBox, SecureData,
    SecureDataType, SecureDataVersion,
};
use tokio::sync::RwLock;

use super::{
    AuthToken, KeyMetadataRepository, PermissionRepository, RepositoryError, SdbRepository,
    SecureDataRepository, SecureDataSummary, TokenRepository,
};

#[derive(Debug, Default)]
struct Tables {
    sdbs: HashMap<String, SafeDepositBox>,
    grants: Vec<PrincipalGrant>,
    secure_data: BTreeMap<(String, String), SecureData>,
    versions: Vec<SecureDataVersion>,
    keys: BTreeMap<(String, String), KeyMetadata>,
    tokens: Vec<AuthToken>,
}

/// Shared, cloneable in-memory store.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepository {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issued token.
    pub async fn insert_token(&self, token: AuthToken) {
        self.inner.write().await.tokens.push(token);
    }

    pub async fn token_count(&self) -> usize {
        self.inner.read().await.tokens.len()
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_owned(), b.to_owned())
}

#[async_trait]
impl PermissionRepository for MemoryRepository {
    async fn get_grant(
        &self,
        principal_key: &str,
        sdb_id: &str,
    ) -> Result<Option<Role>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .grants
            .iter()
            .filter(|g| g.sdb_id == sdb_id)
            .filter(|g| matches!(&g.subject, GrantSubject::IamPrincipal(arn) if arn == principal_key))
            .map(|g| g.role)
            .max())
    }

    async fn get_group_grants(
        &self,
        groups: &[String],
        sdb_id: &str,
    ) -> Result<Vec<Role>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .grants
            .iter()
            .filter(|g| g.sdb_id == sdb_id)
            .filter(|g| matches!(&g.subject, GrantSubject::UserGroup(name) if groups.contains(name)))
            .map(|g| g.role)
            .collect())
    }

    async fn get_group_grants_ignoring_case(
        &self,
        groups: &[String],
        sdb_id: &str,
    ) -> Result<Vec<Role>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .grants
            .iter()
            .filter(|g| g.sdb_id == sdb_id)
            .filter(|g| match &g.subject {
                GrantSubject::UserGroup(name) => {
                    groups.iter().any(|group| group.eq_ignore_ascii_case(name))
                }
                GrantSubject::IamPrincipal(_) => false,
            })
            .map(|g| g.role)
            .collect())
    }

    async fn list_grants(&self, sdb_id: &str) -> Result<Vec<PrincipalGrant>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .grants
            .iter()
            .filter(|g| g.sdb_id == sdb_id)
            .cloned()
            .collect())
    }

    async fn add_grant(&self, grant: PrincipalGrant) -> Result<(), RepositoryError> {
        self.inner.write().await.grants.push(grant);
        Ok(())
    }

    async fn put_grant(&self, grant: PrincipalGrant) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().await;
        tables
            .grants
            .retain(|g| !(g.sdb_id == grant.sdb_id && g.subject == grant.subject));
        tables.grants.push(grant);
        Ok(())
    }

    async fn delete_grant(
        &self,
        sdb_id: &str,
        subject: &GrantSubject,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.inner.write().await;
        let before = tables.grants.len();
        tables
            .grants
            .retain(|g| !(g.sdb_id == sdb_id && &g.subject == subject));
        Ok(tables.grants.len() != before)
    }

    async fn delete_grants_for_sdb(&self, sdb_id: &str) -> Result<usize, RepositoryError> {
        let mut tables = self.inner.write().await;
        let before = tables.grants.len();
        tables.grants.retain(|g| g.sdb_id != sdb_id);
        Ok(before - tables.grants.len())
    }
}

#[async_trait]
impl SdbRepository for MemoryRepository {
    async fn insert_sdb(&self, sdb: SafeDepositBox) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().await;
        if let Some(existing) = tables
            .sdbs
            .values()
            .find(|s| s.id == sdb.id || s.path == sdb.path || s.slug == sdb.slug)
        {
            return Err(RepositoryError::Conflict(format!(
                "safe deposit box {} already exists at {}",
                existing.id, existing.path
            )));
        }
        tables.sdbs.insert(sdb.id.clone(), sdb);
        Ok(())
    }

    async fn get_sdb(&self, sdb_id: &str) -> Result<Option<SafeDepositBox>, RepositoryError> {
        Ok(self.inner.read().await.sdbs.get(sdb_id).cloned())
    }

    async fn list_sdbs(&self) -> Result<Vec<SafeDepositBox>, RepositoryError> {
        let mut sdbs: Vec<_> = self.inner.read().await.sdbs.values().cloned().collect();
        sdbs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(sdbs)
    }

    async fn delete_sdb(&self, sdb_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.inner.write().await.sdbs.remove(sdb_id).is_some())
    }
}

#[async_trait]
impl SecureDataRepository for MemoryRepository {
    async fn get_secure_data(
        &self,
        sdb_id: &str,
        path: &str,
    ) -> Result<Option<SecureData>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .secure_data
            .get(&key(sdb_id, path))
            .cloned())
    }

    async fn upsert_secure_data(&self, record: SecureData) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().await;
        tables
            .secure_data
            .insert(key(&record.sdb_id, &record.path), record);
        Ok(())
    }

    async fn delete_secure_data(&self, sdb_id: &str, path: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .inner
            .write()
            .await
            .secure_data
            .remove(&key(sdb_id, path))
            .is_some())
    }

    async fn replace_blob_if_unchanged(
        &self,
        sdb_id: &str,
        path: &str,
        expected: &EncryptedBlob,
        replacement: EncryptedBlob,
        rotated_ts: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.inner.write().await;
        match tables.secure_data.get_mut(&key(sdb_id, path)) {
            Some(record) if &record.encrypted_blob == expected => {
                record.encrypted_blob = replacement;
                record.last_rotated_ts = rotated_ts;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_summaries(
        &self,
        sdb_id: &str,
        prefix: &str,
        data_type: Option<SecureDataType>,
    ) -> Result<Vec<SecureDataSummary>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .secure_data
            .values()
            .filter(|r| r.sdb_id == sdb_id && r.path.starts_with(prefix))
            .filter(|r| data_type.map_or(true, |t| r.data_type == t))
            .map(|r| SecureDataSummary {
                path: r.path.clone(),
                data_type: r.data_type,
                size_in_bytes: r.size_in_bytes,
            })
            .collect())
    }

    async fn list_rotated_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SecureData>, RepositoryError> {
        let tables = self.inner.read().await;
        let mut due: Vec<_> = tables
            .secure_data
            .values()
            .filter(|r| r.last_rotated_ts < cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.last_rotated_ts);
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_all_secure_data(&self, sdb_id: &str) -> Result<usize, RepositoryError> {
        let mut tables = self.inner.write().await;
        let before = tables.secure_data.len();
        tables.secure_data.retain(|(sdb, _), _| sdb != sdb_id);
        Ok(before - tables.secure_data.len())
    }

    async fn insert_version(&self, version: SecureDataVersion) -> Result<(), RepositoryError> {
        self.inner.write().await.versions.push(version);
        Ok(())
    }

    async fn list_versions(
        &self,
        sdb_id: &str,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SecureDataVersion>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .versions
            .iter()
            .filter(|v| v.sdb_id == sdb_id && v.path == path)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_versions(&self, sdb_id: &str, path: &str) -> Result<u64, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .versions
            .iter()
            .filter(|v| v.sdb_id == sdb_id && v.path == path)
            .count() as u64)
    }

    async fn get_version(
        &self,
        sdb_id: &str,
        version_id: &str,
    ) -> Result<Option<SecureDataVersion>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .versions
            .iter()
            .find(|v| v.sdb_id == sdb_id && v.id == version_id)
            .cloned())
    }

    async fn delete_all_versions(&self, sdb_id: &str) -> Result<usize, RepositoryError> {
        let mut tables = self.inner.write().await;
        let before = tables.versions.len();
        tables.versions.retain(|v| v.sdb_id != sdb_id);
        Ok(before - tables.versions.len())
    }
}

#[async_trait]
impl KeyMetadataRepository for MemoryRepository {
    async fn get_key_metadata(
        &self,
        scope: &str,
        region: &str,
    ) -> Result<Option<KeyMetadata>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .keys
            .get(&key(scope, region))
            .cloned())
    }

    async fn insert_key_metadata(&self, metadata: KeyMetadata) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().await;
        let k = key(&metadata.scope, &metadata.region);
        if tables.keys.contains_key(&k) {
            return Err(RepositoryError::Conflict(format!(
                "key metadata for scope {} in {} already exists",
                metadata.scope, metadata.region
            )));
        }
        tables.keys.insert(k, metadata);
        Ok(())
    }

    async fn update_key_metadata(&self, metadata: KeyMetadata) -> Result<bool, RepositoryError> {
        let mut tables = self.inner.write().await;
        match tables.keys.get_mut(&key(&metadata.scope, &metadata.region)) {
            Some(row) if row.key_id == metadata.key_id => {
                *row = metadata;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_key_metadata(
        &self,
        scope: &str,
        region: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .inner
            .write()
            .await
            .keys
            .remove(&key(scope, region))
            .is_some())
    }

    async fn delete_key_metadata_if_current(
        &self,
        scope: &str,
        region: &str,
        key_id: &str,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.inner.write().await;
        let k = key(scope, region);
        match tables.keys.get(&k) {
            Some(row) if row.key_id == key_id => {
                tables.keys.remove(&k);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_key_metadata(
        &self,
        region: Option<&str>,
    ) -> Result<Vec<KeyMetadata>, RepositoryError> {
        let tables = self.inner.read().await;
        Ok(tables
            .keys
            .values()
            .filter(|m| region.map_or(true, |r| m.region == r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TokenRepository for MemoryRepository {
    async fn delete_expired_tokens(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, RepositoryError> {
        let mut tables = self.inner.write().await;
        let mut removed = 0;
        tables.tokens.retain(|t| {
            if removed < limit && t.expires_ts < now {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
