//! Path-addressed, versioned storage of encrypted secrets.
//!
//! Every payload is encrypted through the [`KeyLifecycleManager`] under the
//! SDB's key and bound to `"<sdb_id>/<path>"`. Plaintext only exists inside
//! a single call and is never logged. Every create, update and delete
//! appends one [`SecureDataVersion`].

pub mod path;

pub use path::{secure_data_id, validate_path};

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    EncryptedBlob, Page, SecureData, SecureDataAction, SecureDataType, SecureDataVersion,
};
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::error::VaultError;
use crate::keys::{secure_data_context, KeyLifecycleManager, KeyScope};
use crate::repository::{SecureDataRepository, SecureDataSummary};

/// One document handed to [`SecureDataStore::restore_all`].
#[derive(Clone)]
pub struct RestoreDocument {
    pub path: String,
    pub data_type: SecureDataType,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for RestoreDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreDocument")
            .field("path", &self.path)
            .field("data_type", &self.data_type)
            .field("payload", &format_args!("[{} bytes]", self.payload.len()))
            .finish()
    }
}

/// Secret payload encrypted and ready to persist.
struct Prepared {
    path: String,
    data_type: SecureDataType,
    blob: EncryptedBlob,
    size_in_bytes: u64,
    top_level_kv_count: Option<u32>,
}

#[derive(Clone)]
pub struct SecureDataStore {
    data: Arc<dyn SecureDataRepository>,
    keys: KeyLifecycleManager,
}

impl SecureDataStore {
    pub fn new(data: Arc<dyn SecureDataRepository>, keys: KeyLifecycleManager) -> Self {
        Self { data, keys }
    }

    /// Current record at `path`, still encrypted.
    pub async fn read(&self, sdb_id: &str, path: &str) -> Result<Option<SecureData>, VaultError> {
        validate_path(path)?;
        Ok(self.data.get_secure_data(sdb_id, path).await?)
    }

    /// Current record at `path` together with its decrypted payload.
    ///
    /// # Errors
    ///
    /// A record that exists but cannot be decrypted yields
    /// [`VaultError::Encryption`], never a partial result.
    #[instrument(skip(self))]
    pub async fn read_decrypted(
        &self,
        sdb_id: &str,
        path: &str,
    ) -> Result<Option<(SecureData, Zeroizing<Vec<u8>>)>, VaultError> {
        let Some(record) = self.read(sdb_id, path).await? else {
            return Ok(None);
        };
        let plaintext = self.open(sdb_id, path, &record.encrypted_blob).await?;
        Ok(Some((record, plaintext)))
    }

    /// Decrypt a blob stored for `(sdb_id, path)`, current or historical.
    pub async fn open(
        &self,
        sdb_id: &str,
        path: &str,
        blob: &EncryptedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.keys
            .decrypt(blob, &secure_data_context(sdb_id, path))
            .await
    }

    /// Create or update the secret at `path`.
    ///
    /// Object payloads must be JSON objects; their top-level key count is
    /// recorded. The payload is encrypted before anything is written, so a
    /// failed encryption leaves both the record and its history untouched.
    #[instrument(skip(self, plaintext))]
    pub async fn write(
        &self,
        sdb_id: &str,
        path: &str,
        plaintext: &[u8],
        data_type: SecureDataType,
        actor: &str,
    ) -> Result<SecureDataAction, VaultError> {
        validate_path(path)?;
        let existing = self.data.get_secure_data(sdb_id, path).await?;
        if let Some(current) = &existing {
            if current.data_type != data_type {
                return Err(VaultError::InvalidRequest(format!(
                    "{path} holds a {:?} secret",
                    current.data_type
                )));
            }
        }

        let prepared = self.prepare(sdb_id, path, plaintext, data_type).await?;
        let now = Utc::now();

        let (record, action) = match existing {
            Some(current) => (
                SecureData {
                    encrypted_blob: prepared.blob,
                    size_in_bytes: prepared.size_in_bytes,
                    top_level_kv_count: prepared.top_level_kv_count,
                    last_updated_ts: now,
                    last_updated_by: actor.to_owned(),
                    last_rotated_ts: now,
                    ..current
                },
                SecureDataAction::Update,
            ),
            None => (new_record(sdb_id, prepared, actor, now), SecureDataAction::Create),
        };

        self.data.upsert_secure_data(record.clone()).await?;
        self.data
            .insert_version(version_of(&record, action, actor, now))
            .await?;

        debug!(action = ?action, size = record.size_in_bytes, "secret written");
        Ok(action)
    }

    /// Remove the secret at `path`, keeping its last blob in a DELETE version.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if nothing of `data_type` is stored at `path`.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        sdb_id: &str,
        path: &str,
        data_type: SecureDataType,
        actor: &str,
    ) -> Result<(), VaultError> {
        validate_path(path)?;
        let current = self
            .data
            .get_secure_data(sdb_id, path)
            .await?
            .filter(|r| r.data_type == data_type)
            .ok_or_else(|| VaultError::NotFound(format!("{sdb_id}/{path}")))?;

        self.remove_with_history(&current, actor, Utc::now()).await
    }

    async fn remove_with_history(
        &self,
        current: &SecureData,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        self.data
            .insert_version(version_of(current, SecureDataAction::Delete, actor, now))
            .await?;
        self.data
            .delete_secure_data(&current.sdb_id, &current.path)
            .await?;
        Ok(())
    }

    /// Immediate children of the object folder at `path` (empty for the SDB
    /// root). Folders end with `/`. Nothing is decrypted.
    pub async fn list_keys(&self, sdb_id: &str, path: &str) -> Result<BTreeSet<String>, VaultError> {
        let prefix = path::folder_prefix(path)?;
        let summaries = self
            .data
            .list_summaries(sdb_id, &prefix, Some(SecureDataType::Object))
            .await?;
        Ok(path::child_keys(
            &prefix,
            summaries.iter().map(|s| s.path.as_str()),
        ))
    }

    /// File secrets anywhere under `path`, with their sizes.
    pub async fn list_files(
        &self,
        sdb_id: &str,
        path: &str,
    ) -> Result<Vec<SecureDataSummary>, VaultError> {
        let prefix = path::folder_prefix(path)?;
        Ok(self
            .data
            .list_summaries(sdb_id, &prefix, Some(SecureDataType::File))
            .await?)
    }

    /// Versions of `path` in the order they were recorded.
    pub async fn list_versions(
        &self,
        sdb_id: &str,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<SecureDataVersion>, VaultError> {
        validate_path(path)?;
        let total = self.data.count_versions(sdb_id, path).await?;
        let items = self.data.list_versions(sdb_id, path, limit, offset).await?;
        Ok(Page {
            items,
            total,
            limit,
            offset,
        })
    }

    pub async fn read_version(
        &self,
        sdb_id: &str,
        version_id: &str,
    ) -> Result<Option<SecureDataVersion>, VaultError> {
        Ok(self.data.get_version(sdb_id, version_id).await?)
    }

    /// Replace every secret in the SDB with `documents`.
    ///
    /// All documents are validated and encrypted first; only then are the
    /// existing secrets deleted (with DELETE versions) and the documents
    /// created (with CREATE versions). Returns the number of documents
    /// restored.
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn restore_all(
        &self,
        sdb_id: &str,
        documents: Vec<RestoreDocument>,
        actor: &str,
    ) -> Result<usize, VaultError> {
        let mut seen = HashSet::new();
        for doc in &documents {
            validate_path(&doc.path)?;
            if !seen.insert(doc.path.as_str()) {
                return Err(VaultError::InvalidRequest(format!(
                    "duplicate path in restore: {}",
                    doc.path
                )));
            }
        }

        let mut prepared = Vec::with_capacity(documents.len());
        for doc in &documents {
            prepared.push(
                self.prepare(sdb_id, &doc.path, &doc.payload, doc.data_type)
                    .await?,
            );
        }

        let now = Utc::now();
        let existing = self.data.list_summaries(sdb_id, "", None).await?;
        for summary in &existing {
            if let Some(current) = self.data.get_secure_data(sdb_id, &summary.path).await? {
                self.remove_with_history(&current, actor, now).await?;
            }
        }

        let restored = prepared.len();
        for item in prepared {
            let record = new_record(sdb_id, item, actor, now);
            self.data.upsert_secure_data(record.clone()).await?;
            self.data
                .insert_version(version_of(&record, SecureDataAction::Create, actor, now))
                .await?;
        }

        info!(removed = existing.len(), restored, "sdb secrets restored");
        Ok(restored)
    }

    /// Drop every secret and version of the SDB without writing history.
    pub async fn purge_sdb(&self, sdb_id: &str) -> Result<(usize, usize), VaultError> {
        let records = self.data.delete_all_secure_data(sdb_id).await?;
        let versions = self.data.delete_all_versions(sdb_id).await?;
        Ok((records, versions))
    }

    async fn prepare(
        &self,
        sdb_id: &str,
        path: &str,
        plaintext: &[u8],
        data_type: SecureDataType,
    ) -> Result<Prepared, VaultError> {
        let top_level_kv_count = match data_type {
            SecureDataType::Object => Some(count_top_level_keys(plaintext)?),
            SecureDataType::File => None,
        };
        let blob = self
            .keys
            .encrypt(
                plaintext,
                &KeyScope::Sdb(sdb_id.to_owned()),
                &secure_data_context(sdb_id, path),
            )
            .await?;
        Ok(Prepared {
            path: path.to_owned(),
            data_type,
            blob,
            size_in_bytes: plaintext.len() as u64,
            top_level_kv_count,
        })
    }
}

fn count_top_level_keys(plaintext: &[u8]) -> Result<u32, VaultError> {
    match serde_json::from_slice::<serde_json::Value>(plaintext) {
        Ok(serde_json::Value::Object(map)) => u32::try_from(map.len())
            .map_err(|_| VaultError::InvalidRequest("too many keys".into())),
        // Parse errors are not echoed: they can quote payload content.
        _ => Err(VaultError::InvalidRequest(
            "secret payload must be a JSON object".into(),
        )),
    }
}

fn new_record(sdb_id: &str, prepared: Prepared, actor: &str, now: DateTime<Utc>) -> SecureData {
    SecureData {
        id: secure_data_id(&prepared.path),
        sdb_id: sdb_id.to_owned(),
        path: prepared.path,
        encrypted_blob: prepared.blob,
        data_type: prepared.data_type,
        size_in_bytes: prepared.size_in_bytes,
        top_level_kv_count: prepared.top_level_kv_count,
        created_ts: now,
        created_by: actor.to_owned(),
        last_updated_ts: now,
        last_updated_by: actor.to_owned(),
        last_rotated_ts: now,
    }
}

fn version_of(
    record: &SecureData,
    action: SecureDataAction,
    actor: &str,
    now: DateTime<Utc>,
) -> SecureDataVersion {
    SecureDataVersion {
        id: uuid::Uuid::new_v4().to_string(),
        sdb_id: record.sdb_id.clone(),
        path: record.path.clone(),
        encrypted_blob: record.encrypted_blob.clone(),
        action,
        action_principal: actor.to_owned(),
        action_ts: now,
        version_created_by: record.last_updated_by.clone(),
        version_created_ts: record.last_updated_ts,
        data_type: record.data_type,
        size_in_bytes: record.size_in_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::manager::tests::manager;
    use crate::kms::InMemoryKms;
    use crate::repository::MemoryRepository;

    fn store(kms: &InMemoryKms, repo: &MemoryRepository) -> SecureDataStore {
        SecureDataStore::new(Arc::new(repo.clone()), manager(kms, repo, &["us-west-2"]))
    }

    async fn decrypted(store: &SecureDataStore, path: &str) -> Vec<u8> {
        let (_, plain) = store.read_decrypted("abc", path).await.unwrap().unwrap();
        plain.to_vec()
    }

    #[tokio::test]
    async fn write_update_and_history() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);

        let first = store
            .write("abc", "db/creds", br#"{"user":"a"}"#, SecureDataType::Object, "alice")
            .await
            .unwrap();
        let second = store
            .write("abc", "db/creds", br#"{"user":"b"}"#, SecureDataType::Object, "bob")
            .await
            .unwrap();
        assert_eq!(first, SecureDataAction::Create);
        assert_eq!(second, SecureDataAction::Update);

        assert_eq!(decrypted(&store, "db/creds").await, br#"{"user":"b"}"#);
        let record = store.read("abc", "db/creds").await.unwrap().unwrap();
        assert_eq!(record.created_by, "alice");
        assert_eq!(record.last_updated_by, "bob");
        assert_eq!(record.top_level_kv_count, Some(1));
        assert_eq!(record.id, secure_data_id("db/creds"));

        let page = store.list_versions("abc", "db/creds", 10, 0).await.unwrap();
        assert_eq!(page.total, 2);
        let actions: Vec<_> = page.items.iter().map(|v| v.action).collect();
        assert_eq!(actions, [SecureDataAction::Create, SecureDataAction::Update]);

        let v1 = store
            .read_version("abc", &page.items[0].id)
            .await
            .unwrap()
            .unwrap();
        let plain = store.open("abc", "db/creds", &v1.encrypted_blob).await.unwrap();
        assert_eq!(&*plain, br#"{"user":"a"}"#);
    }

    #[tokio::test]
    async fn delete_keeps_last_blob() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        store
            .write("abc", "k", br#"{"a":1,"b":2}"#, SecureDataType::Object, "u")
            .await
            .unwrap();
        let blob = store.read("abc", "k").await.unwrap().unwrap().encrypted_blob;

        assert!(matches!(
            store.delete("abc", "k", SecureDataType::File, "u").await,
            Err(VaultError::NotFound(_))
        ));
        store.delete("abc", "k", SecureDataType::Object, "u").await.unwrap();

        assert!(store.read("abc", "k").await.unwrap().is_none());
        let page = store.list_versions("abc", "k", 10, 0).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].action, SecureDataAction::Delete);
        assert_eq!(page.items[1].encrypted_blob, blob);
    }

    #[tokio::test]
    async fn failed_encryption_writes_nothing() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        kms.set_region_available("us-west-2", false).await;

        assert!(store
            .write("abc", "k", br#"{"a":1}"#, SecureDataType::Object, "u")
            .await
            .is_err());
        assert!(store.read("abc", "k").await.unwrap().is_none());
        assert_eq!(store.list_versions("abc", "k", 10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn object_payload_must_be_json_object() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        for bad in [&b"[1,2]"[..], &b"\"s\""[..], &b"{not json"[..]] {
            assert!(matches!(
                store.write("abc", "k", bad, SecureDataType::Object, "u").await,
                Err(VaultError::InvalidRequest(_))
            ));
        }
        // Files are opaque.
        store
            .write("abc", "cert.pem", b"-----BEGIN", SecureDataType::File, "u")
            .await
            .unwrap();
        assert!(matches!(
            store
                .write("abc", "cert.pem", br#"{"a":1}"#, SecureDataType::Object, "u")
                .await,
            Err(VaultError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn listing_keys_and_files() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        for path in ["db/creds", "db/replica/creds", "api"] {
            store
                .write("abc", path, br#"{"k":"v"}"#, SecureDataType::Object, "u")
                .await
                .unwrap();
        }
        store
            .write("abc", "db/tls/cert.pem", b"cert", SecureDataType::File, "u")
            .await
            .unwrap();

        let root = store.list_keys("abc", "").await.unwrap();
        assert_eq!(root, BTreeSet::from(["api".to_owned(), "db/".to_owned()]));
        let db = store.list_keys("abc", "db").await.unwrap();
        assert_eq!(db, BTreeSet::from(["creds".to_owned(), "replica/".to_owned()]));

        let files = store.list_files("abc", "db/").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "db/tls/cert.pem");
        assert_eq!(files[0].size_in_bytes, 4);
    }

    #[tokio::test]
    async fn restore_replaces_everything() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        store
            .write("abc", "old", br#"{"x":1}"#, SecureDataType::Object, "u")
            .await
            .unwrap();

        let docs = vec![
            RestoreDocument {
                path: "new/a".into(),
                data_type: SecureDataType::Object,
                payload: br#"{"y":2}"#.to_vec(),
            },
            RestoreDocument {
                path: "new/b.bin".into(),
                data_type: SecureDataType::File,
                payload: vec![0, 1, 2],
            },
        ];
        assert_eq!(store.restore_all("abc", docs, "admin").await.unwrap(), 2);

        assert!(store.read("abc", "old").await.unwrap().is_none());
        assert_eq!(decrypted(&store, "new/a").await, br#"{"y":2}"#);
        assert_eq!(decrypted(&store, "new/b.bin").await, vec![0, 1, 2]);
        let old_history = store.list_versions("abc", "old", 10, 0).await.unwrap();
        assert_eq!(old_history.items.last().unwrap().action, SecureDataAction::Delete);
    }

    #[tokio::test]
    async fn invalid_restore_changes_nothing() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        store
            .write("abc", "keep", br#"{"x":1}"#, SecureDataType::Object, "u")
            .await
            .unwrap();

        let docs = vec![RestoreDocument {
            path: "bad".into(),
            data_type: SecureDataType::Object,
            payload: b"[]".to_vec(),
        }];
        assert!(store.restore_all("abc", docs, "admin").await.is_err());
        assert!(store.read("abc", "keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn version_count_matches_writes() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let store = store(&kms, &repo);
        for i in 0..5 {
            let body = format!(r#"{{"n":{i}}}"#);
            store
                .write("abc", "counter", body.as_bytes(), SecureDataType::Object, "u")
                .await
                .unwrap();
        }
        let page = store.list_versions("abc", "counter", 2, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_offset(), Some(4));

        let all = store.list_versions("abc", "counter", 10, 0).await.unwrap();
        let latest = all.items.last().unwrap();
        let plain = store.open("abc", "counter", &latest.encrypted_blob).await.unwrap();
        assert_eq!(&*plain, decrypted(&store, "counter").await.as_slice());
    }
}
