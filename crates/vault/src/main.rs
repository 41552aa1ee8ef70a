//! `vault` maintenance worker entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing, optional OTLP export).
//! 3. Initialise per-region AWS KMS clients.
//! 4. Set up repositories and the lock table.
//! 5. Build the key-lifecycle manager.
//! 6. Spawn the maintenance jobs.
//! 7. Run until Ctrl-C, then stop the jobs.
//!
//! The worker holds its key metadata and locks in process memory, so it runs
//! as a single instance and refuses cleanups that would delete keys.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vault::aws::{AwsClients, AwsKmsProvider};
use vault::config::Config;
use vault::jobs::{self, MetadataScope};
use vault::keys::KeyLifecycleManager;
use vault::lock::{InMemoryLockTable, LockClient};
use vault::repository::{MemoryRepository, TokenRepository};
use vault::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %cfg.environment,
        regions = %cfg.encryption_regions,
        "sdb-vault worker starting"
    );

    // -----------------------------------------------------------------------
    // 3. AWS clients
    // -----------------------------------------------------------------------
    let aws = AwsClients::init(&cfg.regions()).await?;
    let kms = Arc::new(AwsKmsProvider::new(aws));

    // -----------------------------------------------------------------------
    // 4. Repositories and locks
    // -----------------------------------------------------------------------
    jobs::check_cleanup_mode(
        MetadataScope::ProcessLocal,
        cfg.orphaned_key_cleanup_dry_run,
        cfg.inactive_key_cleanup_dry_run,
    )?;
    warn!("key metadata and job locks are process-local; run a single worker instance");
    let repo = MemoryRepository::new();
    let tokens: Arc<dyn TokenRepository> = Arc::new(repo.clone());
    let locks = InMemoryLockTable::new(Duration::from_secs(cfg.lock_lease_secs));
    let lock: Arc<dyn LockClient> = Arc::new(locks.client());

    // -----------------------------------------------------------------------
    // 5. Key lifecycle
    // -----------------------------------------------------------------------
    let keys = KeyLifecycleManager::new(
        kms,
        Arc::new(repo.clone()),
        Arc::new(repo),
        cfg.key_settings(),
    )?;

    // -----------------------------------------------------------------------
    // 6. Maintenance jobs
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();

    let token_batch = cfg.token_purge_batch();
    let purge = jobs::spawn_periodic(
        jobs::PURGE_EXPIRED_TOKENS,
        Duration::from_secs(cfg.token_purge_interval_secs),
        Arc::clone(&lock),
        shutdown.clone(),
        move || {
            let tokens = Arc::clone(&tokens);
            async move {
                jobs::purge_expired_tokens(tokens.as_ref(), token_batch)
                    .await
                    .map(drop)
            }
        },
    );

    let rotation_batch = cfg.data_key_rotation_batch();
    let older_than_days = cfg.data_key_rotation_older_than_days;
    let rotate = jobs::spawn_periodic(
        jobs::ROTATE_DATA_KEYS,
        Duration::from_secs(cfg.data_key_rotation_interval_secs),
        Arc::clone(&lock),
        shutdown.clone(),
        {
            let keys = keys.clone();
            move || {
                let keys = keys.clone();
                async move {
                    jobs::rotate_data_keys(&keys, rotation_batch, older_than_days)
                        .await
                        .map(drop)
                }
            }
        },
    );

    let orphan_dry_run = cfg.orphaned_key_cleanup_dry_run;
    let orphans = jobs::spawn_periodic(
        jobs::CLEAN_ORPHANED_KEYS,
        Duration::from_secs(cfg.orphaned_key_cleanup_interval_secs),
        Arc::clone(&lock),
        shutdown.clone(),
        {
            let keys = keys.clone();
            move || {
                let keys = keys.clone();
                async move {
                    jobs::clean_orphaned_keys(&keys, orphan_dry_run)
                        .await
                        .map(drop)
                }
            }
        },
    );

    let inactive_days = cfg.inactive_key_cleanup_inactive_days;
    let inactive_dry_run = cfg.inactive_key_cleanup_dry_run;
    let inactive = jobs::spawn_periodic(
        jobs::CLEAN_INACTIVE_KEYS,
        Duration::from_secs(cfg.inactive_key_cleanup_interval_secs),
        lock,
        shutdown.clone(),
        move || {
            let keys = keys.clone();
            async move {
                jobs::clean_inactive_keys(&keys, inactive_days, inactive_dry_run)
                    .await
                    .map(drop)
            }
        },
    );

    // -----------------------------------------------------------------------
    // 7. Run until interrupted
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    for handle in [purge, rotate, orphans, inactive] {
        if let Err(e) = handle.await {
            warn!(error = %e, "job task ended abnormally");
        }
    }
    telemetry::shutdown_telemetry();

    Ok(())
}
