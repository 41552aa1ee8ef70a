//! Safe deposit box lifecycle and grant management.
//!
//! An SDB's path is `<category>/<slug>/`, fixed at creation. Deleting an SDB
//! cascades to its secrets, their history and its grants, and retires its
//! dedicated master keys through the deletion grace period.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use common::{GrantSubject, PrincipalGrant, Role, SafeDepositBox};
use tracing::{info, instrument};

use crate::arn::ArnNormalizer;
use crate::error::VaultError;
use crate::keys::{KeyLifecycleManager, KeyScope};
use crate::repository::{PermissionRepository, SdbRepository};
use crate::store::SecureDataStore;

/// A grant to apply to an SDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub subject: GrantSubject,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct CreateSdbRequest {
    pub category: String,
    pub name: String,
    pub description: Option<String>,
    /// Group granted the owner role.
    pub owner_group: String,
    pub grants: Vec<GrantRequest>,
}

/// Lowercase `name`, collapsing every run of non-alphanumerics into one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[derive(Clone)]
pub struct SdbService {
    sdbs: Arc<dyn SdbRepository>,
    grants: Arc<dyn PermissionRepository>,
    store: SecureDataStore,
    keys: KeyLifecycleManager,
    arns: ArnNormalizer,
}

impl SdbService {
    pub fn new(
        sdbs: Arc<dyn SdbRepository>,
        grants: Arc<dyn PermissionRepository>,
        store: SecureDataStore,
        keys: KeyLifecycleManager,
        arns: ArnNormalizer,
    ) -> Self {
        Self {
            sdbs,
            grants,
            store,
            keys,
            arns,
        }
    }

    /// Create an SDB, its owner-group grant and any requested grants.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidRequest`] for empty names, duplicate subjects or
    /// unusable principal ARNs; [`VaultError::Conflict`] when the slug or
    /// path is taken.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        request: CreateSdbRequest,
        actor: &str,
    ) -> Result<SafeDepositBox, VaultError> {
        let category = slugify(&request.category);
        let slug = slugify(&request.name);
        if category.is_empty() || slug.is_empty() {
            return Err(VaultError::InvalidRequest(
                "category and name must contain letters or digits".into(),
            ));
        }
        let owner_group = request.owner_group.trim();
        if owner_group.is_empty() {
            return Err(VaultError::InvalidRequest("owner group is required".into()));
        }

        let owner_subject = GrantSubject::UserGroup(owner_group.to_owned());
        let mut subjects = HashSet::from([owner_subject.clone()]);
        let mut grants = vec![GrantRequest {
            subject: owner_subject,
            role: Role::Owner,
        }];
        for grant in request.grants {
            let grant = self.normalize(grant)?;
            if !subjects.insert(grant.subject.clone()) {
                return Err(VaultError::InvalidRequest(format!(
                    "duplicate grant for {}",
                    grant.subject.name()
                )));
            }
            grants.push(grant);
        }

        let now = Utc::now();
        let sdb = SafeDepositBox {
            id: uuid::Uuid::new_v4().to_string(),
            category: category.clone(),
            name: request.name.trim().to_owned(),
            description: request.description,
            path: format!("{category}/{slug}/"),
            slug,
            owner_group: owner_group.to_owned(),
            created_ts: now,
            created_by: actor.to_owned(),
            last_updated_ts: now,
            last_updated_by: actor.to_owned(),
        };
        self.sdbs.insert_sdb(sdb.clone()).await?;

        for grant in grants {
            self.grants
                .add_grant(PrincipalGrant {
                    sdb_id: sdb.id.clone(),
                    subject: grant.subject,
                    role: grant.role,
                    created_ts: now,
                    created_by: actor.to_owned(),
                })
                .await?;
        }

        info!(sdb_id = %sdb.id, path = %sdb.path, "sdb created");
        Ok(sdb)
    }

    pub async fn get(&self, sdb_id: &str) -> Result<Option<SafeDepositBox>, VaultError> {
        Ok(self.sdbs.get_sdb(sdb_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<SafeDepositBox>, VaultError> {
        Ok(self.sdbs.list_sdbs().await?)
    }

    pub async fn list_grants(&self, sdb_id: &str) -> Result<Vec<PrincipalGrant>, VaultError> {
        Ok(self.grants.list_grants(sdb_id).await?)
    }

    /// Delete an SDB and everything under it.
    #[instrument(skip(self))]
    pub async fn delete(&self, sdb_id: &str, actor: &str) -> Result<(), VaultError> {
        let sdb = self
            .sdbs
            .get_sdb(sdb_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("sdb {sdb_id}")))?;

        let (records, versions) = self.store.purge_sdb(&sdb.id).await?;
        let grants = self.grants.delete_grants_for_sdb(&sdb.id).await?;
        self.sdbs.delete_sdb(&sdb.id).await?;
        let keys = self.keys.retire_scope(&KeyScope::Sdb(sdb.id.clone())).await?;

        info!(
            sdb_id = %sdb.id,
            path = %sdb.path,
            records,
            versions,
            grants,
            keys,
            actor,
            "sdb deleted"
        );
        Ok(())
    }

    /// Insert or replace a grant.
    ///
    /// # Errors
    ///
    /// [`VaultError::Conflict`] when this would demote the SDB's only owner.
    pub async fn set_grant(
        &self,
        sdb_id: &str,
        grant: GrantRequest,
        actor: &str,
    ) -> Result<(), VaultError> {
        self.require_sdb(sdb_id).await?;
        let grant = self.normalize(grant)?;
        if grant.role != Role::Owner {
            self.ensure_other_owner(sdb_id, &grant.subject).await?;
        }
        self.grants
            .put_grant(PrincipalGrant {
                sdb_id: sdb_id.to_owned(),
                subject: grant.subject,
                role: grant.role,
                created_ts: Utc::now(),
                created_by: actor.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// Remove a grant.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if no such grant exists;
    /// [`VaultError::Conflict`] when it is the SDB's only owner grant.
    pub async fn revoke_grant(&self, sdb_id: &str, subject: &GrantSubject) -> Result<(), VaultError> {
        self.require_sdb(sdb_id).await?;
        self.ensure_other_owner(sdb_id, subject).await?;
        if !self.grants.delete_grant(sdb_id, subject).await? {
            return Err(VaultError::NotFound(format!("grant for {}", subject.name())));
        }
        Ok(())
    }

    async fn require_sdb(&self, sdb_id: &str) -> Result<SafeDepositBox, VaultError> {
        self.sdbs
            .get_sdb(sdb_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("sdb {sdb_id}")))
    }

    /// Fails if `subject` is the only subject holding an owner grant in the SDB.
    async fn ensure_other_owner(&self, sdb_id: &str, subject: &GrantSubject) -> Result<(), VaultError> {
        let grants = self.grants.list_grants(sdb_id).await?;
        let mut owners = grants.iter().filter(|g| g.role == Role::Owner);
        let holds_owner = owners.clone().any(|g| g.subject == *subject);
        if holds_owner && owners.all(|g| g.subject == *subject) {
            return Err(VaultError::Conflict(format!(
                "{} is the only owner of sdb {sdb_id}",
                subject.name()
            )));
        }
        Ok(())
    }

    /// Validate a grant and fold IAM principals to the form grants are keyed by.
    fn normalize(&self, grant: GrantRequest) -> Result<GrantRequest, VaultError> {
        let subject = match grant.subject {
            GrantSubject::UserGroup(name) => {
                let name = name.trim().to_owned();
                if name.is_empty() {
                    return Err(VaultError::InvalidRequest("group name is empty".into()));
                }
                GrantSubject::UserGroup(name)
            }
            GrantSubject::IamPrincipal(arn) => {
                if self.arns.is_account_root_arn(&arn) {
                    GrantSubject::IamPrincipal(arn)
                } else {
                    GrantSubject::IamPrincipal(self.arns.to_role_arn(&arn)?)
                }
            }
        };
        Ok(GrantRequest {
            subject,
            role: grant.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use common::SecureDataType;

    use super::*;
    use crate::arn::{ArnError, Partition};
    use crate::keys::manager::tests::manager;
    use crate::kms::InMemoryKms;
    use crate::repository::{KeyMetadataRepository, MemoryRepository, SecureDataRepository};

    struct Fixture {
        kms: InMemoryKms,
        repo: MemoryRepository,
        store: SecureDataStore,
        sdbs: SdbService,
    }

    fn fixture() -> Fixture {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let keys = manager(&kms, &repo, &["us-west-2"]);
        let store = SecureDataStore::new(Arc::new(repo.clone()), keys.clone());
        let sdbs = SdbService::new(
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            store.clone(),
            keys,
            ArnNormalizer::new(Partition::Aws),
        );
        Fixture {
            kms,
            repo,
            store,
            sdbs,
        }
    }

    fn request(name: &str) -> CreateSdbRequest {
        CreateSdbRequest {
            category: "Applications".into(),
            name: name.into(),
            description: None,
            owner_group: "eng-owners".into(),
            grants: vec![],
        }
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Payments API (prod)  "), "payments-api-prod");
        assert_eq!(slugify("a__b"), "a-b");
        assert_eq!(slugify("***"), "");
    }

    #[tokio::test]
    async fn create_derives_path_and_owner_grant() {
        let f = fixture();
        let sdb = f.sdbs.create(request("Payments API"), "alice").await.unwrap();
        assert_eq!(sdb.slug, "payments-api");
        assert_eq!(sdb.path, "applications/payments-api/");

        let grants = f.sdbs.list_grants(&sdb.id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].role, Role::Owner);
        assert_eq!(grants[0].subject, GrantSubject::UserGroup("eng-owners".into()));
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let f = fixture();
        f.sdbs.create(request("Payments API"), "alice").await.unwrap();
        assert!(matches!(
            f.sdbs.create(request("payments-api"), "bob").await,
            Err(VaultError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn iam_grants_are_normalized() {
        let f = fixture();
        let mut req = request("svc");
        req.grants = vec![
            GrantRequest {
                subject: GrantSubject::IamPrincipal(
                    "arn:aws:sts::222222:assumed-role/prince_role/session".into(),
                ),
                role: Role::Read,
            },
            GrantRequest {
                subject: GrantSubject::IamPrincipal("arn:aws:iam::333333:root".into()),
                role: Role::Read,
            },
        ];
        let sdb = f.sdbs.create(req, "alice").await.unwrap();
        let grants = f.sdbs.list_grants(&sdb.id).await.unwrap();
        assert!(grants.iter().any(|g| g.subject
            == GrantSubject::IamPrincipal("arn:aws:iam::222222:role/prince_role".into())));
        assert!(grants
            .iter()
            .any(|g| g.subject == GrantSubject::IamPrincipal("arn:aws:iam::333333:root".into())));
    }

    #[tokio::test]
    async fn group_arn_grant_rejected() {
        let f = fixture();
        let mut req = request("svc");
        req.grants = vec![GrantRequest {
            subject: GrantSubject::IamPrincipal("arn:aws:iam::222222:group/devs".into()),
            role: Role::Read,
        }];
        assert!(matches!(
            f.sdbs.create(req, "alice").await,
            Err(VaultError::Identity(ArnError::Ineligible(_)))
        ));
        assert!(f.sdbs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_owner_cannot_be_revoked_or_demoted() {
        let f = fixture();
        let sdb = f.sdbs.create(request("svc"), "alice").await.unwrap();
        let owners = GrantSubject::UserGroup("eng-owners".into());

        assert!(matches!(
            f.sdbs.revoke_grant(&sdb.id, &owners).await,
            Err(VaultError::Conflict(_))
        ));
        assert!(matches!(
            f.sdbs
                .set_grant(
                    &sdb.id,
                    GrantRequest {
                        subject: owners.clone(),
                        role: Role::Read
                    },
                    "alice"
                )
                .await,
            Err(VaultError::Conflict(_))
        ));

        f.sdbs
            .set_grant(
                &sdb.id,
                GrantRequest {
                    subject: GrantSubject::UserGroup("platform".into()),
                    role: Role::Owner,
                },
                "alice",
            )
            .await
            .unwrap();
        f.sdbs.revoke_grant(&sdb.id, &owners).await.unwrap();
        assert!(matches!(
            f.sdbs.revoke_grant(&sdb.id, &owners).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn repeated_owner_rows_of_one_subject_still_count_as_last_owner() {
        let f = fixture();
        let sdb = f.sdbs.create(request("svc"), "alice").await.unwrap();
        let owners = GrantSubject::UserGroup("eng-owners".into());
        f.repo
            .add_grant(PrincipalGrant {
                sdb_id: sdb.id.clone(),
                subject: owners.clone(),
                role: Role::Owner,
                created_ts: Utc::now(),
                created_by: "import".into(),
            })
            .await
            .unwrap();

        assert!(matches!(
            f.sdbs.revoke_grant(&sdb.id, &owners).await,
            Err(VaultError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades_and_retires_key() {
        let f = fixture();
        let sdb = f.sdbs.create(request("svc"), "alice").await.unwrap();
        f.store
            .write(&sdb.id, "db/creds", br#"{"u":"a"}"#, SecureDataType::Object, "alice")
            .await
            .unwrap();

        f.sdbs.delete(&sdb.id, "alice").await.unwrap();

        assert!(f.sdbs.get(&sdb.id).await.unwrap().is_none());
        assert!(f.sdbs.list_grants(&sdb.id).await.unwrap().is_empty());
        assert!(f.repo.get_secure_data(&sdb.id, "db/creds").await.unwrap().is_none());
        assert_eq!(f.repo.count_versions(&sdb.id, "db/creds").await.unwrap(), 0);
        assert!(f.repo.list_key_metadata(None).await.unwrap().is_empty());
        let scheduled = f.kms.scheduled_deletions().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].pending_days, 30);
    }
}
