//! Maintenance jobs and their periodic driver.
//!
//! Job bodies are plain async functions over injected collaborators, so each
//! can be exercised on its own. [`spawn_periodic`] runs one of them on a
//! fixed interval, each run gated by the distributed lock under the job's
//! name.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::VaultError;
use crate::keys::KeyLifecycleManager;
use crate::lock::{run_under_lock, JobOutcome, LockClient, ReleasePolicy};
use crate::repository::TokenRepository;

pub const PURGE_EXPIRED_TOKENS: &str = "purge-expired-tokens";
pub const ROTATE_DATA_KEYS: &str = "rotate-data-keys";
pub const CLEAN_ORPHANED_KEYS: &str = "clean-orphaned-keys";
pub const CLEAN_INACTIVE_KEYS: &str = "clean-inactive-keys";

/// Reach of the key metadata the cleanup jobs compare provider keys against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataScope {
    /// One table shared by every instance of the fleet.
    Shared,
    /// A table that only this process writes to.
    ProcessLocal,
}

/// Reject cleanup settings that would delete provider keys on the word of
/// process-local metadata, where every managed key looks untracked.
///
/// # Errors
///
/// [`VaultError::InvalidRequest`] when `metadata` is process-local and either
/// cleanup is not a dry run.
pub fn check_cleanup_mode(
    metadata: MetadataScope,
    orphan_dry_run: bool,
    inactive_dry_run: bool,
) -> Result<(), VaultError> {
    if metadata == MetadataScope::Shared {
        return Ok(());
    }
    for (dry_run, job) in [
        (orphan_dry_run, CLEAN_ORPHANED_KEYS),
        (inactive_dry_run, CLEAN_INACTIVE_KEYS),
    ] {
        if !dry_run {
            return Err(VaultError::InvalidRequest(format!(
                "{job} may only run as a dry run against process-local key metadata"
            )));
        }
    }
    Ok(())
}

/// Bounds for a batched job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Upper bound on rows touched by one run.
    pub max_total: usize,
    /// Pause between full batches.
    pub pause: Duration,
}

/// Delete expired authentication tokens in batches. Returns the number
/// deleted.
pub async fn purge_expired_tokens(
    tokens: &dyn TokenRepository,
    batch: BatchSettings,
) -> Result<usize, VaultError> {
    let now = Utc::now();
    let mut total = 0;
    loop {
        let limit = batch.batch_size.min(batch.max_total - total);
        if limit == 0 {
            break;
        }
        let deleted = tokens.delete_expired_tokens(now, limit).await?;
        total += deleted;
        if deleted < limit {
            break;
        }
        time::sleep(batch.pause).await;
    }
    info!(job = PURGE_EXPIRED_TOKENS, deleted = total, "expired tokens purged");
    Ok(total)
}

/// Rotate data keys of stale records until a short batch or `max_total`.
/// Returns the number of records rotated.
pub async fn rotate_data_keys(
    keys: &KeyLifecycleManager,
    batch: BatchSettings,
    older_than_days: u32,
) -> Result<usize, VaultError> {
    let mut total = 0;
    loop {
        let limit = batch.batch_size.min(batch.max_total - total);
        if limit == 0 {
            break;
        }
        let rotated = keys.rotate(limit, batch.pause, older_than_days).await?;
        total += rotated;
        if rotated < limit {
            break;
        }
    }
    info!(job = ROTATE_DATA_KEYS, rotated = total, "data key rotation finished");
    Ok(total)
}

/// Reconcile orphaned master keys in every configured region. A region that
/// fails is logged and skipped. Returns the number of orphans found.
pub async fn clean_orphaned_keys(
    keys: &KeyLifecycleManager,
    dry_run: bool,
) -> Result<usize, VaultError> {
    let mut found = 0;
    for region in &keys.settings().regions {
        match keys.reconcile(region, dry_run).await {
            Ok(orphans) => {
                if !orphans.is_empty() {
                    info!(
                        job = CLEAN_ORPHANED_KEYS,
                        region = %region,
                        dry_run,
                        orphans = ?orphans,
                        "orphaned master keys"
                    );
                }
                found += orphans.len();
            }
            Err(e) => warn!(
                job = CLEAN_ORPHANED_KEYS,
                region = %region,
                error = %e,
                "reconciliation failed for region"
            ),
        }
    }
    Ok(found)
}

/// Retire principal-scoped keys unused for `inactive_days`. Returns the
/// number of keys found inactive.
pub async fn clean_inactive_keys(
    keys: &KeyLifecycleManager,
    inactive_days: u32,
    dry_run: bool,
) -> Result<usize, VaultError> {
    let inactive = keys.cleanup_inactive(inactive_days, dry_run).await?;
    for meta in &inactive {
        info!(
            job = CLEAN_INACTIVE_KEYS,
            scope = %meta.scope,
            region = %meta.region,
            key_id = %meta.key_id,
            dry_run,
            "inactive master key"
        );
    }
    Ok(inactive.len())
}

/// Run `job` every `every` under the lock `name` until `shutdown` fires.
///
/// The first tick is skipped so a freshly started instance does not run
/// every job at once.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    lock: Arc<dyn LockClient>,
    shutdown: CancellationToken,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), VaultError>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome =
                        run_under_lock(lock.as_ref(), name, ReleasePolicy::default(), &job).await;
                    if outcome == JobOutcome::Skipped {
                        info!(job = name, "run skipped");
                    }
                }
            }
        }
        info!(job = name, "job scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use common::{SecureData, SecureDataType};

    use super::*;
    use crate::keys::manager::tests::manager;
    use crate::keys::{secure_data_context, KeyScope};
    use crate::kms::InMemoryKms;
    use crate::lock::InMemoryLockTable;
    use crate::repository::{AuthToken, MemoryRepository, SecureDataRepository};

    fn batch(batch_size: usize, max_total: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            max_total,
            pause: Duration::from_millis(100),
        }
    }

    async fn seed_tokens(repo: &MemoryRepository, expired: usize, live: usize) {
        let now = Utc::now();
        for i in 0..expired + live {
            let expires_ts = if i < expired {
                now - ChronoDuration::hours(1)
            } else {
                now + ChronoDuration::hours(1)
            };
            repo.insert_token(AuthToken {
                id: format!("t{i}"),
                principal: "alice".into(),
                created_ts: now - ChronoDuration::hours(2),
                expires_ts,
            })
            .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn token_purge_runs_batches_to_completion() {
        let repo = MemoryRepository::new();
        seed_tokens(&repo, 25, 5).await;

        assert_eq!(purge_expired_tokens(&repo, batch(10, 1000)).await.unwrap(), 25);
        assert_eq!(repo.token_count().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn token_purge_respects_max_total() {
        let repo = MemoryRepository::new();
        seed_tokens(&repo, 25, 0).await;

        assert_eq!(purge_expired_tokens(&repo, batch(10, 15)).await.unwrap(), 15);
        assert_eq!(repo.token_count().await, 10);
    }

    async fn seed_record(keys: &KeyLifecycleManager, repo: &MemoryRepository, path: &str) {
        let blob = keys
            .encrypt(
                b"{\"k\":\"v\"}",
                &KeyScope::Sdb("abc".into()),
                &secure_data_context("abc", path),
            )
            .await
            .unwrap();
        let ts = Utc::now() - ChronoDuration::days(200);
        repo.upsert_secure_data(SecureData {
            id: 1,
            sdb_id: "abc".into(),
            path: path.into(),
            encrypted_blob: blob,
            data_type: SecureDataType::Object,
            size_in_bytes: 9,
            top_level_kv_count: Some(1),
            created_ts: ts,
            created_by: "u".into(),
            last_updated_ts: ts,
            last_updated_by: "u".into(),
            last_rotated_ts: ts,
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_job_stops_at_max_total() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let keys = manager(&kms, &repo, &["us-west-2"]);
        for path in ["a", "b", "c", "d", "e"] {
            seed_record(&keys, &repo, path).await;
        }

        assert_eq!(rotate_data_keys(&keys, batch(2, 3), 90).await.unwrap(), 3);
        assert_eq!(rotate_data_keys(&keys, batch(2, 100), 90).await.unwrap(), 2);
        assert_eq!(rotate_data_keys(&keys, batch(2, 100), 90).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn orphan_job_covers_every_region() {
        let kms = InMemoryKms::new();
        let repo = MemoryRepository::new();
        let keys = manager(&kms, &repo, &["us-west-2", "us-east-1", "cn-north-1"]);
        let policy = crate::kms::KeyPolicy {
            environment: "test".into(),
            service_role_arn: crate::keys::manager::tests::ROLE.into(),
            account_root_arn: "arn:aws:iam::111111111111:root".into(),
            consumer_arn: None,
        }
        .to_json();
        kms.insert_key("us-west-2", &policy).await;
        kms.insert_key("us-east-1", &policy).await;

        assert_eq!(clean_orphaned_keys(&keys, true).await.unwrap(), 2);
        assert!(kms.scheduled_deletions().await.is_empty());
    }

    #[test]
    fn process_local_metadata_allows_only_dry_run_cleanup() {
        assert!(check_cleanup_mode(MetadataScope::ProcessLocal, true, true).is_ok());
        assert!(matches!(
            check_cleanup_mode(MetadataScope::ProcessLocal, false, true),
            Err(VaultError::InvalidRequest(msg)) if msg.contains(CLEAN_ORPHANED_KEYS)
        ));
        assert!(matches!(
            check_cleanup_mode(MetadataScope::ProcessLocal, true, false),
            Err(VaultError::InvalidRequest(msg)) if msg.contains(CLEAN_INACTIVE_KEYS)
        ));
        assert!(check_cleanup_mode(MetadataScope::Shared, false, false).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_driver_runs_under_lock_until_shutdown() {
        let table = InMemoryLockTable::new(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = spawn_periodic(
            "test-job",
            Duration::from_secs(10),
            Arc::new(table.client()),
            shutdown.clone(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        // Skipped first tick, then runs at 10s, 20s and 30s.
        time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // A lock held by another instance turns runs into skips.
        let other = table.client();
        assert!(other.acquire("test-job").await.unwrap());
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
