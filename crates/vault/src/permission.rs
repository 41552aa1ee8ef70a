//! Effective-role resolution for a principal within one SDB.
//!
//! IAM principals match grants keyed by their normalized role ARN and by
//! their account root ARN. Users match grants keyed by any of their groups;
//! when no exact-case group grant exists the lookup is retried ignoring case,
//! unless case-sensitive matching is configured. The effective role is the
//! highest role among all matches.

use std::sync::Arc;

use common::Role;
use tracing::{debug, instrument};

use crate::arn::ArnNormalizer;
use crate::error::VaultError;
use crate::principal::Principal;
use crate::repository::PermissionRepository;

#[derive(Clone)]
pub struct PermissionResolver {
    grants: Arc<dyn PermissionRepository>,
    arns: ArnNormalizer,
    groups_case_sensitive: bool,
}

impl PermissionResolver {
    pub fn new(
        grants: Arc<dyn PermissionRepository>,
        arns: ArnNormalizer,
        groups_case_sensitive: bool,
    ) -> Self {
        Self {
            grants,
            arns,
            groups_case_sensitive,
        }
    }

    /// Highest role `principal` holds in `sdb_id`, or `None`.
    ///
    /// Read-only; safe to call on every request.
    #[instrument(skip(self, principal), fields(principal = %principal.name))]
    pub async fn resolve(
        &self,
        principal: &Principal,
        sdb_id: &str,
    ) -> Result<Option<Role>, VaultError> {
        let roles = if principal.is_iam() {
            let role_arn = self.arns.to_role_arn(&principal.name)?;
            let root_arn = self.arns.account_root_arn(&principal.name)?;
            let mut roles = Vec::with_capacity(2);
            roles.extend(self.grants.get_grant(&role_arn, sdb_id).await?);
            roles.extend(self.grants.get_grant(&root_arn, sdb_id).await?);
            roles
        } else {
            let groups: Vec<String> = principal.groups.iter().cloned().collect();
            if groups.is_empty() {
                return Ok(None);
            }
            let exact = self.grants.get_group_grants(&groups, sdb_id).await?;
            if exact.is_empty() && !self.groups_case_sensitive {
                self.grants
                    .get_group_grants_ignoring_case(&groups, sdb_id)
                    .await?
            } else {
                exact
            }
        };

        let effective = roles.into_iter().max();
        debug!(role = ?effective, "permission resolved");
        Ok(effective)
    }

    /// Resolve and require at least `required`.
    ///
    /// # Errors
    ///
    /// [`VaultError::AccessDenied`] when the principal's role is missing or
    /// lower than `required`.
    pub async fn require(
        &self,
        principal: &Principal,
        sdb_id: &str,
        required: Role,
    ) -> Result<Role, VaultError> {
        match self.resolve(principal, sdb_id).await? {
            Some(role) if role.permits(required) => Ok(role),
            _ => Err(VaultError::AccessDenied {
                principal: principal.name.clone(),
                sdb_id: sdb_id.to_owned(),
            }),
        }
    }
}
