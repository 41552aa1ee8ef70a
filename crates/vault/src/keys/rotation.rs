//! Data-key rotation for current secure data records.

use std::time::Duration;

use chrono::Utc;
use common::SecureData;
use tracing::{debug, info, instrument, warn};

use super::{secure_data_context, KeyLifecycleManager, KeyScope};
use crate::error::VaultError;

impl KeyLifecycleManager {
    /// Re-encrypt at most `batch_size` records last rotated more than
    /// `older_than_days` ago, oldest first, each under a fresh data key.
    ///
    /// A record that fails is logged and skipped. After a full batch the call
    /// sleeps `pause` so back-to-back invocations stay throttled. Returns the
    /// number of records rotated.
    ///
    /// # Errors
    ///
    /// Only a failure to select the batch is returned.
    #[instrument(skip(self))]
    pub async fn rotate(
        &self,
        batch_size: usize,
        pause: Duration,
        older_than_days: u32,
    ) -> Result<usize, VaultError> {
        if batch_size == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let batch = self.data.list_rotated_before(cutoff, batch_size).await?;

        let mut rotated = 0;
        for record in &batch {
            match self.rotate_record(record).await {
                Ok(true) => rotated += 1,
                Ok(false) => debug!(
                    sdb_id = %record.sdb_id,
                    path = %record.path,
                    "record changed during rotation; left as is"
                ),
                Err(err) => warn!(
                    sdb_id = %record.sdb_id,
                    path = %record.path,
                    error = %err,
                    "data key rotation failed for record; skipping"
                ),
            }
        }

        info!(selected = batch.len(), rotated, "data key rotation batch finished");

        if batch.len() == batch_size && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        Ok(rotated)
    }

    async fn rotate_record(&self, record: &SecureData) -> Result<bool, VaultError> {
        let context = secure_data_context(&record.sdb_id, &record.path);
        let plaintext = self.decrypt(&record.encrypted_blob, &context).await?;
        let replacement = self
            .encrypt(&plaintext, &KeyScope::Sdb(record.sdb_id.clone()), &context)
            .await?;
        Ok(self
            .data
            .replace_blob_if_unchanged(
                &record.sdb_id,
                &record.path,
                &record.encrypted_blob,
                replacement,
                Utc::now(),
            )
            .await?)
    }
}
