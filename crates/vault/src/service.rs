//! Access-controlled entry points.
//!
//! Every operation resolves the caller's role in the target SDB before doing
//! any work and reports the result to the [`AuditSink`]. Callers see denial
//! and absence through the same [`common::ServiceError::NotAccessible`].

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{
    GrantSubject, Page, PrincipalGrant, Role, SafeDepositBox, SecureData, SecureDataAction,
    SecureDataType, SecureDataVersion,
};
use tracing::{instrument, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditAction, AuditEvent, AuditOutcome, AuditSink};
use crate::error::VaultError;
use crate::permission::PermissionResolver;
use crate::principal::Principal;
use crate::repository::SecureDataSummary;
use crate::sdb::{CreateSdbRequest, GrantRequest, SdbService};
use crate::store::{RestoreDocument, SecureDataStore};

/// A decrypted secret or secret version.
pub struct Secret<T> {
    pub record: T,
    pub payload: Zeroizing<Vec<u8>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("record", &self.record)
            .field("payload", &format_args!("[{} bytes]", self.payload.len()))
            .finish()
    }
}

#[derive(Clone)]
pub struct VaultService {
    permissions: PermissionResolver,
    store: SecureDataStore,
    sdbs: SdbService,
    audit: Arc<dyn AuditSink>,
}

impl VaultService {
    pub fn new(
        permissions: PermissionResolver,
        store: SecureDataStore,
        sdbs: SdbService,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            permissions,
            store,
            sdbs,
            audit,
        }
    }

    #[instrument(skip(self, principal), fields(principal = %principal.name))]
    pub async fn read_secret(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
    ) -> Result<Secret<SecureData>, VaultError> {
        let op = Op::new(principal, AuditAction::ReadSecret, sdb_id).path(path);
        self.authorize(&op, Role::Read).await?;
        let result = self
            .store
            .read_decrypted(sdb_id, path)
            .await
            .and_then(|found| found.ok_or_else(|| not_found(sdb_id, path)))
            .map(|(record, payload)| Secret { record, payload });
        self.finish(&op, result).await
    }

    #[instrument(skip(self, principal, payload), fields(principal = %principal.name))]
    pub async fn write_secret(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
        payload: &[u8],
        data_type: SecureDataType,
    ) -> Result<SecureDataAction, VaultError> {
        let op = Op::new(principal, AuditAction::WriteSecret, sdb_id).path(path);
        self.authorize(&op, Role::Write).await?;
        let result = self
            .store
            .write(sdb_id, path, payload, data_type, &principal.name)
            .await;
        self.finish(&op, result).await
    }

    #[instrument(skip(self, principal), fields(principal = %principal.name))]
    pub async fn delete_secret(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
        data_type: SecureDataType,
    ) -> Result<(), VaultError> {
        let op = Op::new(principal, AuditAction::DeleteSecret, sdb_id).path(path);
        self.authorize(&op, Role::Write).await?;
        let result = self
            .store
            .delete(sdb_id, path, data_type, &principal.name)
            .await;
        self.finish(&op, result).await
    }

    pub async fn list_keys(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
    ) -> Result<BTreeSet<String>, VaultError> {
        let op = Op::new(principal, AuditAction::ListKeys, sdb_id).path(path);
        self.authorize(&op, Role::Read).await?;
        let result = self.store.list_keys(sdb_id, path).await;
        self.finish(&op, result).await
    }

    pub async fn list_files(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
    ) -> Result<Vec<SecureDataSummary>, VaultError> {
        let op = Op::new(principal, AuditAction::ListFiles, sdb_id).path(path);
        self.authorize(&op, Role::Read).await?;
        let result = self.store.list_files(sdb_id, path).await;
        self.finish(&op, result).await
    }

    pub async fn list_versions(
        &self,
        principal: &Principal,
        sdb_id: &str,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<SecureDataVersion>, VaultError> {
        let op = Op::new(principal, AuditAction::ListVersions, sdb_id).path(path);
        self.authorize(&op, Role::Read).await?;
        let result = self.store.list_versions(sdb_id, path, limit, offset).await;
        self.finish(&op, result).await
    }

    /// A version's metadata and the payload it recorded.
    #[instrument(skip(self, principal), fields(principal = %principal.name))]
    pub async fn read_version(
        &self,
        principal: &Principal,
        sdb_id: &str,
        version_id: &str,
    ) -> Result<Secret<SecureDataVersion>, VaultError> {
        let op = Op::new(principal, AuditAction::ReadVersion, sdb_id);
        self.authorize(&op, Role::Read).await?;
        let result = async {
            let version = self
                .store
                .read_version(sdb_id, version_id)
                .await?
                .ok_or_else(|| VaultError::NotFound(format!("version {version_id}")))?;
            let payload = self
                .store
                .open(sdb_id, &version.path, &version.encrypted_blob)
                .await?;
            Ok::<_, VaultError>(Secret {
                record: version,
                payload,
            })
        }
        .await;
        self.finish(&op, result).await
    }

    pub async fn restore(
        &self,
        principal: &Principal,
        sdb_id: &str,
        documents: Vec<RestoreDocument>,
    ) -> Result<usize, VaultError> {
        let op = Op::new(principal, AuditAction::RestoreSdb, sdb_id);
        self.authorize(&op, Role::Owner).await?;
        let result = self
            .store
            .restore_all(sdb_id, documents, &principal.name)
            .await;
        self.finish(&op, result).await
    }

    /// Create an SDB. Users must belong to the group they name as owner.
    pub async fn create_sdb(
        &self,
        principal: &Principal,
        request: CreateSdbRequest,
    ) -> Result<SafeDepositBox, VaultError> {
        let mut op = Op::new(principal, AuditAction::CreateSdb, "");
        if !principal.is_iam() && !principal.groups.contains(request.owner_group.trim()) {
            self.record(&op, AuditOutcome::Denied).await;
            return Err(VaultError::AccessDenied {
                principal: principal.name.clone(),
                sdb_id: request.name,
            });
        }
        let result = self.sdbs.create(request, &principal.name).await;
        if let Ok(sdb) = &result {
            op.sdb_id = sdb.id.clone();
            op.path = Some(sdb.path.clone());
        }
        self.finish(&op, result).await
    }

    pub async fn get_sdb(
        &self,
        principal: &Principal,
        sdb_id: &str,
    ) -> Result<SafeDepositBox, VaultError> {
        let op = Op::new(principal, AuditAction::ReadSdb, sdb_id);
        self.authorize(&op, Role::Read).await?;
        let result = self
            .sdbs
            .get(sdb_id)
            .await
            .and_then(|found| found.ok_or_else(|| VaultError::NotFound(format!("sdb {sdb_id}"))));
        self.finish(&op, result).await
    }

    pub async fn list_grants(
        &self,
        principal: &Principal,
        sdb_id: &str,
    ) -> Result<Vec<PrincipalGrant>, VaultError> {
        let op = Op::new(principal, AuditAction::ListGrants, sdb_id);
        self.authorize(&op, Role::Read).await?;
        let result = self.sdbs.list_grants(sdb_id).await;
        self.finish(&op, result).await
    }

    pub async fn delete_sdb(&self, principal: &Principal, sdb_id: &str) -> Result<(), VaultError> {
        let op = Op::new(principal, AuditAction::DeleteSdb, sdb_id);
        self.authorize(&op, Role::Owner).await?;
        let result = self.sdbs.delete(sdb_id, &principal.name).await;
        self.finish(&op, result).await
    }

    pub async fn set_grant(
        &self,
        principal: &Principal,
        sdb_id: &str,
        grant: GrantRequest,
    ) -> Result<(), VaultError> {
        let op = Op::new(principal, AuditAction::SetGrant, sdb_id);
        self.authorize(&op, Role::Owner).await?;
        let result = self.sdbs.set_grant(sdb_id, grant, &principal.name).await;
        self.finish(&op, result).await
    }

    pub async fn revoke_grant(
        &self,
        principal: &Principal,
        sdb_id: &str,
        subject: &GrantSubject,
    ) -> Result<(), VaultError> {
        let op = Op::new(principal, AuditAction::RevokeGrant, sdb_id);
        self.authorize(&op, Role::Owner).await?;
        let result = self.sdbs.revoke_grant(sdb_id, subject).await;
        self.finish(&op, result).await
    }

    async fn authorize(&self, op: &Op<'_>, required: Role) -> Result<(), VaultError> {
        match self
            .permissions
            .require(op.principal, &op.sdb_id, required)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let outcome = match &err {
                    VaultError::AccessDenied { .. } => {
                        warn!(
                            principal = %op.principal.name,
                            sdb_id = %op.sdb_id,
                            action = ?op.action,
                            required = %required,
                            "access denied"
                        );
                        AuditOutcome::Denied
                    }
                    other => AuditOutcome::Failed(other.to_string()),
                };
                self.record(op, outcome).await;
                Err(err)
            }
        }
    }

    async fn finish<T>(&self, op: &Op<'_>, result: Result<T, VaultError>) -> Result<T, VaultError> {
        let outcome = match &result {
            Ok(_) => AuditOutcome::Succeeded,
            Err(err) => {
                warn!(
                    principal = %op.principal.name,
                    sdb_id = %op.sdb_id,
                    action = ?op.action,
                    error = %err,
                    "operation failed"
                );
                AuditOutcome::Failed(err.to_string())
            }
        };
        self.record(op, outcome).await;
        result
    }

    async fn record(&self, op: &Op<'_>, outcome: AuditOutcome) {
        let mut event = AuditEvent::new(&op.principal.name, op.action, outcome);
        if !op.sdb_id.is_empty() {
            event = event.sdb(&op.sdb_id);
        }
        if let Some(path) = &op.path {
            event = event.path(path);
        }
        self.audit.record(event).await;
    }
}

/// The audited shape of one call.
struct Op<'a> {
    principal: &'a Principal,
    action: AuditAction,
    sdb_id: String,
    path: Option<String>,
}

impl<'a> Op<'a> {
    fn new(principal: &'a Principal, action: AuditAction, sdb_id: &str) -> Self {
        Self {
            principal,
            action,
            sdb_id: sdb_id.to_owned(),
            path: None,
        }
    }

    fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }
}

fn not_found(sdb_id: &str, path: &str) -> VaultError {
    VaultError::NotFound(format!("{sdb_id}/{path}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use common::ServiceError;

    use super::*;
    use crate::arn::{ArnNormalizer, Partition};
    use crate::audit::MockAuditSink;
    use crate::keys::manager::tests::manager;
    use crate::kms::InMemoryKms;
    use crate::repository::MemoryRepository;

    #[derive(Default, Clone)]
    struct Collected(Arc<Mutex<Vec<AuditEvent>>>);

    #[async_trait]
    impl AuditSink for Collected {
        async fn record(&self, event: AuditEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Collected {
        fn outcomes(&self) -> Vec<(AuditAction, AuditOutcome)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|e| (e.action, e.outcome.clone()))
                .collect()
        }
    }

    fn service(audit: Arc<dyn AuditSink>) -> VaultService {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let arns = ArnNormalizer::new(Partition::Aws);
        let keys = manager(&kms, &repo, &["us-west-2"]);
        let store = SecureDataStore::new(Arc::new(repo.clone()), keys.clone());
        let sdbs = SdbService::new(
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            store.clone(),
            keys,
            arns,
        );
        let permissions = PermissionResolver::new(Arc::new(repo), arns, false);
        VaultService::new(permissions, store, sdbs, audit)
    }

    fn owner() -> Principal {
        Principal::user("alice", ["eng-owners"])
    }

    fn reader() -> Principal {
        Principal::user("bob", ["readers"])
    }

    async fn setup(svc: &VaultService) -> SafeDepositBox {
        let sdb = svc
            .create_sdb(
                &owner(),
                CreateSdbRequest {
                    category: "apps".into(),
                    name: "payments".into(),
                    description: None,
                    owner_group: "eng-owners".into(),
                    grants: vec![GrantRequest {
                        subject: GrantSubject::UserGroup("readers".into()),
                        role: Role::Read,
                    }],
                },
            )
            .await
            .unwrap();
        svc.write_secret(
            &owner(),
            &sdb.id,
            "db/creds",
            br#"{"user":"a"}"#,
            SecureDataType::Object,
        )
        .await
        .unwrap();
        sdb
    }

    #[tokio::test]
    async fn reader_reads_but_cannot_write() {
        let audit = Collected::default();
        let svc = service(Arc::new(audit.clone()));
        let sdb = setup(&svc).await;

        let secret = svc.read_secret(&reader(), &sdb.id, "db/creds").await.unwrap();
        assert_eq!(&*secret.payload, br#"{"user":"a"}"#);

        let err = svc
            .write_secret(&reader(), &sdb.id, "db/creds", b"{}", SecureDataType::Object)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AccessDenied { .. }));

        assert_eq!(
            audit.outcomes(),
            vec![
                (AuditAction::CreateSdb, AuditOutcome::Succeeded),
                (AuditAction::WriteSecret, AuditOutcome::Succeeded),
                (AuditAction::ReadSecret, AuditOutcome::Succeeded),
                (AuditAction::WriteSecret, AuditOutcome::Denied),
            ]
        );
    }

    #[tokio::test]
    async fn sdb_reads_are_audited_including_denials() {
        let audit = Collected::default();
        let svc = service(Arc::new(audit.clone()));
        let sdb = setup(&svc).await;
        let stranger = Principal::user("mallory", ["other"]);

        assert!(matches!(
            svc.get_sdb(&stranger, &sdb.id).await,
            Err(VaultError::AccessDenied { .. })
        ));
        assert!(matches!(
            svc.list_grants(&stranger, &sdb.id).await,
            Err(VaultError::AccessDenied { .. })
        ));
        assert_eq!(svc.get_sdb(&reader(), &sdb.id).await.unwrap().id, sdb.id);
        assert_eq!(svc.list_grants(&reader(), &sdb.id).await.unwrap().len(), 2);

        assert_eq!(
            audit.outcomes()[2..],
            [
                (AuditAction::ReadSdb, AuditOutcome::Denied),
                (AuditAction::ListGrants, AuditOutcome::Denied),
                (AuditAction::ReadSdb, AuditOutcome::Succeeded),
                (AuditAction::ListGrants, AuditOutcome::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn denial_and_absence_look_the_same() {
        let svc = service(Arc::new(Collected::default()));
        let sdb = setup(&svc).await;

        let missing = svc.read_secret(&owner(), &sdb.id, "db/nope").await.unwrap_err();
        assert!(matches!(missing, VaultError::NotFound(_)));
        let stranger = Principal::user("mallory", ["other"]);
        let denied = svc.read_secret(&stranger, &sdb.id, "db/creds").await.unwrap_err();

        let (missing, denied) = (ServiceError::from(missing), ServiceError::from(denied));
        assert_eq!(missing.http_status(), 404);
        assert_eq!(missing.to_string(), denied.to_string());
        assert_eq!(missing.code(), denied.code());
    }

    #[tokio::test]
    async fn versions_through_the_facade() {
        let svc = service(Arc::new(Collected::default()));
        let sdb = setup(&svc).await;
        svc.write_secret(
            &owner(),
            &sdb.id,
            "db/creds",
            br#"{"user":"b"}"#,
            SecureDataType::Object,
        )
        .await
        .unwrap();

        let page = svc
            .list_versions(&reader(), &sdb.id, "db/creds", 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].action, SecureDataAction::Create);
        assert_eq!(page.items[1].action, SecureDataAction::Update);

        let first = svc
            .read_version(&reader(), &sdb.id, &page.items[0].id)
            .await
            .unwrap();
        assert_eq!(&*first.payload, br#"{"user":"a"}"#);
        assert!(!format!("{first:?}").contains("user"));
    }

    #[tokio::test]
    async fn owner_only_operations() {
        let svc = service(Arc::new(Collected::default()));
        let sdb = setup(&svc).await;

        let restore = svc
            .restore(
                &reader(),
                &sdb.id,
                vec![RestoreDocument {
                    path: "x".into(),
                    data_type: SecureDataType::Object,
                    payload: b"{}".to_vec(),
                }],
            )
            .await;
        assert!(matches!(restore, Err(VaultError::AccessDenied { .. })));
        assert!(matches!(
            svc.delete_sdb(&reader(), &sdb.id).await,
            Err(VaultError::AccessDenied { .. })
        ));

        svc.delete_sdb(&owner(), &sdb.id).await.unwrap();
        assert!(matches!(
            svc.read_secret(&owner(), &sdb.id, "db/creds").await,
            Err(VaultError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn create_requires_membership_in_owner_group() {
        let mut audit = MockAuditSink::new();
        audit
            .expect_record()
            .withf(|e| e.action == AuditAction::CreateSdb && e.outcome == AuditOutcome::Denied)
            .times(1)
            .return_const(());
        let svc = service(Arc::new(audit));

        let result = svc
            .create_sdb(
                &reader(),
                CreateSdbRequest {
                    category: "apps".into(),
                    name: "payments".into(),
                    description: None,
                    owner_group: "eng-owners".into(),
                    grants: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(VaultError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn failures_are_audited_without_payload() {
        let audit = Collected::default();
        let svc = service(Arc::new(audit.clone()));
        let sdb = setup(&svc).await;

        let err = svc
            .write_secret(
                &owner(),
                &sdb.id,
                "db/creds",
                b"[\"hunter2\"]",
                SecureDataType::Object,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidRequest(_)));

        let events = audit.0.lock().unwrap();
        let last = events.last().unwrap();
        assert!(matches!(&last.outcome, AuditOutcome::Failed(reason) if !reason.contains("hunter2")));
    }
}
