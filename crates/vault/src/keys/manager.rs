//! [`KeyLifecycleManager`]: envelope encryption and master-key resolution.

use std::sync::Arc;

use chrono::Utc;
use common::{EncryptedBlob, KeyMetadata};
use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use super::{KeyMetadataCache, KeyScope, KeySettings, SYSTEM_ACTOR};
use crate::arn::{ArnError, ArnNormalizer, Partition};
use crate::crypto::{Algorithm, DataKey, EncryptionError, Envelope, EnvelopeHeader, WrappedDataKey};
use crate::error::VaultError;
use crate::kms::{KeyPolicy, KmsError, KmsProvider};
use crate::repository::{KeyMetadataRepository, RepositoryError, SecureDataRepository};

/// Re-reads of a changing key row before giving up.
const MAX_REVALIDATION_ROUNDS: usize = 3;

/// Creates, validates and uses master keys on behalf of the rest of the core.
#[derive(Clone)]
pub struct KeyLifecycleManager {
    pub(super) kms: Arc<dyn KmsProvider>,
    pub(super) metadata: Arc<dyn KeyMetadataRepository>,
    pub(super) data: Arc<dyn SecureDataRepository>,
    pub(super) cache: KeyMetadataCache,
    pub(super) settings: KeySettings,
    pub(super) arns: ArnNormalizer,
}

impl KeyLifecycleManager {
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidRequest`] when no encryption region is configured.
    pub fn new(
        kms: Arc<dyn KmsProvider>,
        metadata: Arc<dyn KeyMetadataRepository>,
        data: Arc<dyn SecureDataRepository>,
        settings: KeySettings,
    ) -> Result<Self, VaultError> {
        let primary = settings
            .primary_region()
            .ok_or_else(|| VaultError::InvalidRequest("no encryption regions configured".into()))?;
        let arns = ArnNormalizer::new(Partition::from_region(primary));
        Ok(Self {
            kms,
            metadata,
            data,
            cache: KeyMetadataCache::new(),
            settings,
            arns,
        })
    }

    pub fn settings(&self) -> &KeySettings {
        &self.settings
    }

    /// Encrypt `plaintext` for `scope`, bound to `context`.
    ///
    /// The fresh data key is wrapped under the scope's master key in every
    /// configured region; any region failing fails the whole call.
    #[instrument(skip(self, plaintext), fields(scope = %scope))]
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        scope: &KeyScope,
        context: &str,
    ) -> Result<EncryptedBlob, VaultError> {
        let data_key = DataKey::generate();

        let keys = try_join_all(self.settings.regions.iter().map(|region| {
            let data_key = &data_key;
            async move {
                let master = self.resolve_master_key(scope, region).await?;
                let blob = self
                    .kms
                    .encrypt(region, &master.key_id, data_key.as_bytes())
                    .await
                    .map_err(|e| key_unavailable(&master.key_id, region, &e))?;
                Ok::<_, VaultError>(WrappedDataKey {
                    region: region.clone(),
                    key_id: master.key_id,
                    blob,
                })
            }
        }))
        .await?;

        let header = EnvelopeHeader {
            alg: Algorithm::Aes256GcmSiv,
            scope: scope.to_string(),
            keys,
        };
        let envelope = Envelope::seal(header, &data_key, plaintext, context)?;
        Ok(envelope.to_blob())
    }

    /// Decrypt a blob produced by [`KeyLifecycleManager::encrypt`] with the
    /// same `context`.
    ///
    /// Wrapped keys are tried primary region first, then the remaining
    /// configured regions, then any region only the envelope knows about.
    #[instrument(skip(self, blob))]
    pub async fn decrypt(
        &self,
        blob: &EncryptedBlob,
        context: &str,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let envelope = Envelope::parse(blob)?;

        let mut candidates: Vec<&WrappedDataKey> = envelope.header().keys.iter().collect();
        candidates.sort_by_key(|k| {
            self.settings
                .regions
                .iter()
                .position(|r| *r == k.region)
                .unwrap_or(usize::MAX)
        });

        let mut last_error = None;
        for wrapped in candidates {
            match self
                .kms
                .decrypt(&wrapped.region, &wrapped.key_id, &wrapped.blob)
                .await
            {
                Ok(raw) => {
                    let raw = Zeroizing::new(raw);
                    let data_key = DataKey::from_slice(&raw).map_err(EncryptionError::from)?;
                    return Ok(envelope.open(&data_key, context)?);
                }
                Err(err) => {
                    warn!(
                        region = %wrapped.region,
                        key_id = %wrapped.key_id,
                        error = %err,
                        "could not unwrap data key; trying next region"
                    );
                    last_error = Some(match err {
                        KmsError::InvalidCiphertext(_) => EncryptionError::IntegrityFailure,
                        other => key_unavailable(&wrapped.key_id, &wrapped.region, &other),
                    });
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EncryptionError::MalformedEnvelope("no wrapped data keys".into()))
            .into())
    }

    /// Tracked master key for `(scope, region)`, creating it on first use and
    /// replacing it when the provider reports it unusable.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn resolve_master_key(
        &self,
        scope: &KeyScope,
        region: &str,
    ) -> Result<KeyMetadata, VaultError> {
        let scope_key = scope.to_string();

        let known = match self.cache.get(&scope_key, region) {
            Some(hit) => Some(hit),
            None => self.metadata.get_key_metadata(&scope_key, region).await?,
        };

        match known {
            Some(meta) if !self.is_stale(&meta) => {
                self.cache.insert(meta.clone());
                Ok(meta)
            }
            Some(meta) => self.revalidate(scope, meta).await,
            None => self.provision(scope, region).await,
        }
    }

    fn is_stale(&self, meta: &KeyMetadata) -> bool {
        Utc::now() - meta.last_validated_ts >= self.settings.validation_interval
    }

    /// Check a stale key with the provider and act on the stored row.
    ///
    /// The cached entry only names the row to look at; another instance may
    /// already have revalidated or replaced it. The row is touched or deleted
    /// only while it still names the key just checked.
    async fn revalidate(
        &self,
        scope: &KeyScope,
        cached: KeyMetadata,
    ) -> Result<KeyMetadata, VaultError> {
        let KeyMetadata {
            scope: scope_key,
            region,
            ..
        } = cached;

        for _ in 0..MAX_REVALIDATION_ROUNDS {
            let Some(mut meta) = self.metadata.get_key_metadata(&scope_key, &region).await? else {
                self.cache.remove(&scope_key, &region);
                return self.provision(scope, &region).await;
            };
            if !self.is_stale(&meta) {
                self.cache.insert(meta.clone());
                return Ok(meta);
            }

            let state = self
                .kms
                .describe_key(&region, &meta.key_id)
                .await
                .map_err(|e| key_unavailable(&meta.key_id, &region, &e))?
                .state;

            if state.is_usable() {
                let now = Utc::now();
                meta.last_validated_ts = now;
                meta.last_updated_ts = now;
                meta.last_updated_by = SYSTEM_ACTOR.to_owned();
                if self.metadata.update_key_metadata(meta.clone()).await? {
                    self.cache.insert(meta.clone());
                    debug!(key_id = %meta.key_id, region = %region, "master key revalidated");
                    return Ok(meta);
                }
                debug!(key_id = %meta.key_id, region = %region, "key row changed during revalidation");
                continue;
            }

            warn!(
                key_id = %meta.key_id,
                region = %region,
                state = ?state,
                "master key unusable; provisioning a replacement"
            );
            if self
                .metadata
                .delete_key_metadata_if_current(&scope_key, &region, &meta.key_id)
                .await?
            {
                self.cache.remove(&scope_key, &region);
                return self.provision(scope, &region).await;
            }
            debug!(key_id = %meta.key_id, region = %region, "master key already replaced elsewhere");
        }

        Err(VaultError::Conflict(format!(
            "master key for {scope_key} in {region} kept changing during revalidation"
        )))
    }

    async fn provision(&self, scope: &KeyScope, region: &str) -> Result<KeyMetadata, VaultError> {
        let policy = self.policy_for(scope)?;
        let base_alias = scope.alias(&self.settings.environment);

        // A second attempt is needed when the alias still points at a key
        // that was retired or replaced.
        for attempt in 0..2 {
            let alias = if attempt == 0 {
                base_alias.clone()
            } else {
                format!("{base_alias}-{}", uuid::Uuid::new_v4().simple())
            };

            match self.kms.create_key(region, &policy, &alias).await {
                Ok(key_id) => return self.record_new_key(scope, region, key_id).await,
                Err(KmsError::AlreadyExists(_)) => {
                    if let Some(existing) = self
                        .metadata
                        .get_key_metadata(&scope.to_string(), region)
                        .await?
                    {
                        debug!(key_id = %existing.key_id, "another instance provisioned the key");
                        self.cache.insert(existing.clone());
                        return Ok(existing);
                    }
                }
                Err(err) => {
                    return Err(EncryptionError::Provider(format!(
                        "create key for {scope} in {region}: {err}"
                    ))
                    .into())
                }
            }
        }

        Err(EncryptionError::Provider(format!("could not provision a key for {scope} in {region}")).into())
    }

    async fn record_new_key(
        &self,
        scope: &KeyScope,
        region: &str,
        key_id: String,
    ) -> Result<KeyMetadata, VaultError> {
        let now = Utc::now();
        let meta = KeyMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            region: region.to_owned(),
            key_id,
            created_ts: now,
            created_by: SYSTEM_ACTOR.to_owned(),
            last_updated_ts: now,
            last_updated_by: SYSTEM_ACTOR.to_owned(),
            last_validated_ts: now,
        };

        match self.metadata.insert_key_metadata(meta.clone()).await {
            Ok(()) => {
                info!(key_id = %meta.key_id, region, scope = %meta.scope, "master key provisioned");
                self.cache.insert(meta.clone());
                Ok(meta)
            }
            Err(RepositoryError::Conflict(_)) => {
                // Lost the race; the key just created is left for orphan cleanup.
                warn!(key_id = %meta.key_id, region, "metadata row already present; using winner's key");
                let winner = self
                    .metadata
                    .get_key_metadata(&meta.scope, region)
                    .await?
                    .ok_or_else(|| VaultError::Conflict(format!("key metadata for {}", meta.scope)))?;
                self.cache.insert(winner.clone());
                Ok(winner)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn policy_for(&self, scope: &KeyScope) -> Result<KeyPolicy, VaultError> {
        let consumer_arn = match scope {
            KeyScope::Sdb(_) => None,
            KeyScope::Principal(arn) => {
                if !self.arns.is_arn_eligible_for_key_policy(arn) {
                    return Err(ArnError::Ineligible(arn.clone()).into());
                }
                Some(arn.clone())
            }
        };
        Ok(KeyPolicy {
            environment: self.settings.environment.clone(),
            service_role_arn: self.settings.service_role_arn.clone(),
            account_root_arn: self.settings.account_root_arn.clone(),
            consumer_arn,
        })
    }
}

fn key_unavailable(key_id: &str, region: &str, err: &KmsError) -> EncryptionError {
    EncryptionError::MasterKeyUnavailable {
        key_id: key_id.to_owned(),
        region: region.to_owned(),
        reason: err.to_string(),
    }
}
