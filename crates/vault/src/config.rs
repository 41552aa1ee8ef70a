//! Configuration loading and validation for the vault worker.
//!
//! All values are read from environment variables at startup. The process
//! exits with a clear error message if any required variable is missing or
//! invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::arn::{ArnNormalizer, Partition};
use crate::jobs::BatchSettings;
use crate::keys::KeySettings;

/// Upper bound for `KEY_VALIDATION_INTERVAL_SECS`: thirty days.
const MAX_KEY_VALIDATION_INTERVAL_SECS: u64 = 30 * 86_400;

/// Validated worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Environment name embedded in key policies and aliases. **Required.**
    pub environment: String,

    /// IAM role the service runs as; administers every managed key. **Required.**
    pub service_role_arn: String,

    /// Root ARN of the account hosting the keys. **Required.**
    pub account_root_arn: String,

    /// Comma-separated encryption regions, primary first. **Required.**
    pub encryption_regions: String,

    #[serde(default = "default_key_deletion_grace_days")]
    pub key_deletion_grace_days: u32,

    /// How stale a key's last validation may get before the provider is asked again.
    #[serde(default = "default_key_validation_interval")]
    pub key_validation_interval_secs: u64,

    /// Disables the case-insensitive group fallback when `true`.
    #[serde(default)]
    pub user_groups_case_sensitive: bool,

    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,

    #[serde(default = "default_hourly")]
    pub token_purge_interval_secs: u64,
    #[serde(default = "default_token_purge_batch_size")]
    pub token_purge_batch_size: usize,
    #[serde(default = "default_token_purge_max_total")]
    pub token_purge_max_total: usize,
    #[serde(default = "default_token_purge_pause")]
    pub token_purge_pause_millis: u64,

    #[serde(default = "default_hourly")]
    pub data_key_rotation_interval_secs: u64,
    #[serde(default = "default_rotation_batch_size")]
    pub data_key_rotation_batch_size: usize,
    #[serde(default = "default_rotation_max_total")]
    pub data_key_rotation_max_total: usize,
    #[serde(default = "default_rotation_pause")]
    pub data_key_rotation_pause_millis: u64,
    /// Records last rotated more recently than this are left alone.
    #[serde(default = "default_rotation_older_than_days")]
    pub data_key_rotation_older_than_days: u32,

    #[serde(default = "default_daily")]
    pub orphaned_key_cleanup_interval_secs: u64,
    #[serde(default = "default_true")]
    pub orphaned_key_cleanup_dry_run: bool,

    #[serde(default = "default_daily")]
    pub inactive_key_cleanup_interval_secs: u64,
    #[serde(default = "default_inactive_days")]
    pub inactive_key_cleanup_inactive_days: u32,
    #[serde(default = "default_true")]
    pub inactive_key_cleanup_dry_run: bool,

    /// OTLP collector endpoint; spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_deletion_grace_days() -> u32 {
    30
}
fn default_key_validation_interval() -> u64 {
    3600
}
fn default_lock_lease() -> u64 {
    900
}
fn default_hourly() -> u64 {
    3600
}
fn default_daily() -> u64 {
    86_400
}
fn default_token_purge_batch_size() -> usize {
    1000
}
fn default_token_purge_max_total() -> usize {
    100_000
}
fn default_token_purge_pause() -> u64 {
    100
}
fn default_rotation_batch_size() -> usize {
    100
}
fn default_rotation_max_total() -> usize {
    10_000
}
fn default_rotation_pause() -> u64 {
    500
}
fn default_rotation_older_than_days() -> u32 {
    90
}
fn default_inactive_days() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Encryption regions in configured order, primary first.
    pub fn regions(&self) -> Vec<String> {
        self.encryption_regions
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Partition of the primary region.
    pub fn partition(&self) -> Partition {
        self.regions()
            .first()
            .map(|r| Partition::from_region(r))
            .unwrap_or(Partition::Aws)
    }

    pub fn key_settings(&self) -> KeySettings {
        KeySettings {
            environment: self.environment.clone(),
            service_role_arn: self.service_role_arn.clone(),
            account_root_arn: self.account_root_arn.clone(),
            regions: self.regions(),
            validation_interval: chrono::Duration::seconds(
                self.key_validation_interval_secs
                    .min(MAX_KEY_VALIDATION_INTERVAL_SECS) as i64,
            ),
            deletion_grace_days: self.key_deletion_grace_days,
        }
    }

    pub fn token_purge_batch(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.token_purge_batch_size,
            max_total: self.token_purge_max_total,
            pause: Duration::from_millis(self.token_purge_pause_millis),
        }
    }

    pub fn data_key_rotation_batch(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.data_key_rotation_batch_size,
            max_total: self.data_key_rotation_max_total,
            pause: Duration::from_millis(self.data_key_rotation_pause_millis),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.environment, "ENVIRONMENT")?;
        ensure_non_empty(&self.service_role_arn, "SERVICE_ROLE_ARN")?;
        ensure_non_empty(&self.account_root_arn, "ACCOUNT_ROOT_ARN")?;

        let regions = self.regions();
        if regions.is_empty() {
            anyhow::bail!("ENCRYPTION_REGIONS must list at least one region");
        }
        let partition = self.partition();
        if let Some(other) = regions
            .iter()
            .find(|r| Partition::from_region(r) != partition)
        {
            anyhow::bail!("ENCRYPTION_REGIONS mixes partitions: {other} is not in {partition}");
        }

        let arns = ArnNormalizer::new(partition);
        if !arns.is_role_arn(&self.service_role_arn) {
            anyhow::bail!("SERVICE_ROLE_ARN must be an IAM role ARN in partition {partition}");
        }
        if !arns.is_account_root_arn(&self.account_root_arn) {
            anyhow::bail!("ACCOUNT_ROOT_ARN must be an account root ARN in partition {partition}");
        }

        for (value, name) in [
            (self.key_validation_interval_secs, "KEY_VALIDATION_INTERVAL_SECS"),
            (self.lock_lease_secs, "LOCK_LEASE_SECS"),
            (self.token_purge_interval_secs, "TOKEN_PURGE_INTERVAL_SECS"),
            (self.data_key_rotation_interval_secs, "DATA_KEY_ROTATION_INTERVAL_SECS"),
            (self.orphaned_key_cleanup_interval_secs, "ORPHANED_KEY_CLEANUP_INTERVAL_SECS"),
            (self.inactive_key_cleanup_interval_secs, "INACTIVE_KEY_CLEANUP_INTERVAL_SECS"),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be > 0");
            }
        }
        if self.key_validation_interval_secs > MAX_KEY_VALIDATION_INTERVAL_SECS {
            anyhow::bail!(
                "KEY_VALIDATION_INTERVAL_SECS must be at most {MAX_KEY_VALIDATION_INTERVAL_SECS}"
            );
        }
        for (value, name) in [
            (self.token_purge_batch_size, "TOKEN_PURGE_BATCH_SIZE"),
            (self.token_purge_max_total, "TOKEN_PURGE_MAX_TOTAL"),
            (self.data_key_rotation_batch_size, "DATA_KEY_ROTATION_BATCH_SIZE"),
            (self.data_key_rotation_max_total, "DATA_KEY_ROTATION_MAX_TOTAL"),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be > 0");
            }
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
