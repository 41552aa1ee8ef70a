//! Master-key retirement: deletion scheduling, orphan reconciliation and
//! inactive principal-key cleanup.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use common::KeyMetadata;
use tracing::{debug, info, instrument, warn};

use super::{clamp_grace_days, KeyLifecycleManager, KeyScope};
use crate::arn::Partition;
use crate::error::VaultError;
use crate::kms::{policy, KmsError, MasterKeyState};

/// Untracked keys younger than this are left alone; their creator may not
/// have recorded them yet.
const ORPHAN_MIN_AGE_SECS: i64 = 3600;

impl KeyLifecycleManager {
    /// Schedule provider-side deletion of a master key.
    ///
    /// `grace_days` is clamped into the allowed window, so a key is never
    /// deleted sooner than the minimum grace period.
    #[instrument(skip(self))]
    pub async fn schedule_deletion(
        &self,
        key_id: &str,
        region: &str,
        grace_days: u32,
    ) -> Result<u32, VaultError> {
        let days = clamp_grace_days(grace_days);
        self.kms.schedule_key_deletion(region, key_id, days).await?;
        info!(key_id, region, pending_days = days, "master key scheduled for deletion");
        Ok(days)
    }

    /// Stop tracking every master key of `scope` and schedule them for
    /// deletion. Returns the number of keys retired.
    ///
    /// Metadata goes first; a key whose deletion could not be scheduled is
    /// left for orphan reconciliation.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn retire_scope(&self, scope: &KeyScope) -> Result<usize, VaultError> {
        let scope_key = scope.to_string();
        let rows: Vec<KeyMetadata> = self
            .metadata
            .list_key_metadata(None)
            .await?
            .into_iter()
            .filter(|m| m.scope == scope_key)
            .collect();

        for meta in &rows {
            self.forget_and_delete(meta).await?;
        }
        Ok(rows.len())
    }

    /// Master keys in `region` that carry this environment's ownership tag
    /// but have no metadata row and are at least an hour old. Unless
    /// `dry_run`, each one is scheduled for deletion.
    ///
    /// Regions outside the commercial partition are skipped and yield an
    /// empty set.
    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        region: &str,
        dry_run: bool,
    ) -> Result<BTreeSet<String>, VaultError> {
        let partition = Partition::from_region(region);
        if !partition.supports_key_reconciliation() {
            info!(%partition, "skipping key reconciliation outside the commercial partition");
            return Ok(BTreeSet::new());
        }

        let tracked: HashSet<String> = self
            .metadata
            .list_key_metadata(Some(region))
            .await?
            .into_iter()
            .map(|m| m.key_id)
            .collect();

        let young_cutoff = Utc::now() - chrono::Duration::seconds(ORPHAN_MIN_AGE_SECS);
        let mut orphans = BTreeSet::new();
        for key_id in self.kms.list_keys(region).await? {
            if tracked.contains(&key_id) {
                continue;
            }
            let policy_json = match self.kms.get_key_policy(region, &key_id).await {
                Ok(doc) => doc,
                // Keys we may not read are not ours.
                Err(KmsError::AccessDenied(_) | KmsError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(key_id = %key_id, error = %err, "could not read key policy");
                    continue;
                }
            };
            if !policy::is_managed_by(
                &policy_json,
                &self.settings.environment,
                &self.settings.service_role_arn,
            ) {
                continue;
            }
            match self.kms.describe_key(region, &key_id).await {
                Ok(d) if matches!(d.state, MasterKeyState::PendingDeletion | MasterKeyState::Missing) => {
                    continue
                }
                // May still be waiting for its metadata row.
                Ok(d) if d.created_at.map_or(true, |t| t > young_cutoff) => {
                    debug!(key_id = %key_id, "untracked key too young to reconcile");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(key_id = %key_id, error = %err, "could not describe key; leaving it");
                    continue;
                }
            }
            orphans.insert(key_id);
        }

        info!(count = orphans.len(), dry_run, "orphaned master keys found");

        if !dry_run {
            for key_id in &orphans {
                if let Err(err) = self
                    .schedule_deletion(key_id, region, self.settings.deletion_grace_days)
                    .await
                {
                    warn!(key_id = %key_id, error = %err, "could not schedule orphan deletion");
                }
            }
        }
        Ok(orphans)
    }

    /// Principal-scoped keys not validated for `inactive_days`. Unless
    /// `dry_run`, their metadata is removed and the keys are scheduled for
    /// deletion. SDB keys are never considered inactive.
    #[instrument(skip(self))]
    pub async fn cleanup_inactive(
        &self,
        inactive_days: u32,
        dry_run: bool,
    ) -> Result<Vec<KeyMetadata>, VaultError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(inactive_days));
        let inactive: Vec<KeyMetadata> = self
            .metadata
            .list_key_metadata(None)
            .await?
            .into_iter()
            .filter(|m| KeyScope::parse(&m.scope).is_some_and(|s| s.is_principal()))
            .filter(|m| m.last_validated_ts < cutoff)
            .collect();

        info!(count = inactive.len(), dry_run, "inactive principal keys found");

        if !dry_run {
            for meta in &inactive {
                self.forget_and_delete(meta).await?;
            }
        }
        Ok(inactive)
    }

    async fn forget_and_delete(&self, meta: &KeyMetadata) -> Result<(), VaultError> {
        self.cache.remove(&meta.scope, &meta.region);
        if !self
            .metadata
            .delete_key_metadata_if_current(&meta.scope, &meta.region, &meta.key_id)
            .await?
        {
            debug!(key_id = %meta.key_id, region = %meta.region, "key row already replaced; not retiring");
            return Ok(());
        }
        if let Err(err) = self
            .schedule_deletion(&meta.key_id, &meta.region, self.settings.deletion_grace_days)
            .await
        {
            warn!(
                key_id = %meta.key_id,
                region = %meta.region,
                error = %err,
                "could not schedule key deletion; leaving it for reconciliation"
            );
        }
        Ok(())
    }
}
