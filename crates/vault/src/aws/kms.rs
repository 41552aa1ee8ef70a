//! [`KmsProvider`] backed by `aws-sdk-kms`.

use async_trait::async_trait;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{KeyState, KeyUsageType};
use tracing::{debug, instrument, warn};

use super::AwsClients;
use crate::kms::{KeyDescription, KeyPolicy, KmsError, KmsProvider, MasterKeyState};

const LIST_KEYS_PAGE_SIZE: i32 = 1000;

pub struct AwsKmsProvider {
    clients: AwsClients,
}

impl AwsKmsProvider {
    pub fn new(clients: AwsClients) -> Self {
        Self { clients }
    }

    fn client(&self, region: &str) -> Result<&aws_sdk_kms::Client, KmsError> {
        self.clients
            .kms(region)
            .map_err(|e| KmsError::Provider(e.to_string()))
    }
}

fn provider_error<E: std::error::Error>(op: &str, err: E) -> KmsError {
    KmsError::Provider(format!("{op}: {}", DisplayErrorContext(&err)))
}

#[async_trait]
impl KmsProvider for AwsKmsProvider {
    #[instrument(skip(self, policy))]
    async fn create_key(
        &self,
        region: &str,
        policy: &KeyPolicy,
        alias: &str,
    ) -> Result<String, KmsError> {
        let client = self.client(region)?;

        let created = client
            .create_key()
            .policy(policy.to_json())
            .key_usage(KeyUsageType::EncryptDecrypt)
            .description(format!("sdb-vault {} {alias}", policy.environment))
            .send()
            .await
            .map_err(|e| provider_error("create_key", e))?;

        let key_arn = created
            .key_metadata()
            .and_then(|m| m.arn())
            .ok_or_else(|| KmsError::Provider("create_key returned no key ARN".into()))?
            .to_owned();

        // The key exists from here on; a lost alias race leaves it for the
        // orphan cleanup job.
        if let Err(err) = client
            .create_alias()
            .alias_name(alias)
            .target_key_id(&key_arn)
            .send()
            .await
        {
            if err
                .as_service_error()
                .is_some_and(|e| e.is_already_exists_exception())
            {
                warn!(alias, key_id = %key_arn, "alias already claimed by another instance");
                return Err(KmsError::AlreadyExists(alias.to_owned()));
            }
            return Err(provider_error("create_alias", err));
        }

        debug!(key_id = %key_arn, "master key created");
        Ok(key_arn)
    }

    #[instrument(skip(self, plaintext))]
    async fn encrypt(
        &self,
        region: &str,
        key_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let out = self
            .client(region)?
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found_exception() => KmsError::NotFound(key_id.to_owned()),
                Some(e) if e.is_disabled_exception() || e.is_kms_invalid_state_exception() => {
                    KmsError::AccessDenied(key_id.to_owned())
                }
                _ => provider_error("encrypt", err),
            })?;

        out.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::Provider("encrypt returned no ciphertext".into()))
    }

    #[instrument(skip(self, ciphertext))]
    async fn decrypt(
        &self,
        region: &str,
        key_id: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let out = self
            .client(region)?
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found_exception() => KmsError::NotFound(key_id.to_owned()),
                Some(e) if e.is_disabled_exception() || e.is_kms_invalid_state_exception() => {
                    KmsError::AccessDenied(key_id.to_owned())
                }
                Some(e) if e.is_invalid_ciphertext_exception() || e.is_incorrect_key_exception() => {
                    KmsError::InvalidCiphertext(key_id.to_owned())
                }
                _ => provider_error("decrypt", err),
            })?;

        out.plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| KmsError::Provider("decrypt returned no plaintext".into()))
    }

    #[instrument(skip(self))]
    async fn list_keys(&self, region: &str) -> Result<Vec<String>, KmsError> {
        let client = self.client(region)?;
        let mut keys = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = client
                .list_keys()
                .limit(LIST_KEYS_PAGE_SIZE)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| provider_error("list_keys", e))?;

            keys.extend(
                page.keys()
                    .iter()
                    .filter_map(|k| k.key_arn().map(str::to_owned)),
            );

            match page.next_marker() {
                Some(next) if page.truncated() => marker = Some(next.to_owned()),
                _ => break,
            }
        }

        debug!(count = keys.len(), "listed master keys");
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get_key_policy(&self, region: &str, key_id: &str) -> Result<String, KmsError> {
        let out = self
            .client(region)?
            .get_key_policy()
            .key_id(key_id)
            .policy_name("default")
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found_exception() => KmsError::NotFound(key_id.to_owned()),
                _ => provider_error("get_key_policy", err),
            })?;

        out.policy()
            .map(str::to_owned)
            .ok_or_else(|| KmsError::Provider("get_key_policy returned no policy".into()))
    }

    #[instrument(skip(self))]
    async fn describe_key(
        &self,
        region: &str,
        key_id: &str,
    ) -> Result<KeyDescription, KmsError> {
        let out = match self
            .client(region)?
            .describe_key()
            .key_id(key_id)
            .send()
            .await
        {
            Ok(out) => out,
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found_exception()) =>
            {
                return Ok(KeyDescription::missing());
            }
            Err(err) => return Err(provider_error("describe_key", err)),
        };

        let Some(meta) = out.key_metadata() else {
            return Ok(KeyDescription::missing());
        };
        let state = match meta.key_state() {
            Some(KeyState::Enabled) => MasterKeyState::Enabled,
            Some(KeyState::Disabled) => MasterKeyState::Disabled,
            Some(KeyState::PendingDeletion) => MasterKeyState::PendingDeletion,
            Some(_) => MasterKeyState::Other,
            None => MasterKeyState::Missing,
        };
        let created_at = meta
            .creation_date()
            .and_then(|d| chrono::DateTime::from_timestamp(d.secs(), d.subsec_nanos()));
        Ok(KeyDescription { state, created_at })
    }

    #[instrument(skip(self))]
    async fn schedule_key_deletion(
        &self,
        region: &str,
        key_id: &str,
        pending_days: u32,
    ) -> Result<(), KmsError> {
        let days = i32::try_from(pending_days)
            .map_err(|_| KmsError::Provider(format!("invalid pending window {pending_days}")))?;

        self.client(region)?
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(days)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found_exception() => KmsError::NotFound(key_id.to_owned()),
                _ => provider_error("schedule_key_deletion", err),
            })?;
        Ok(())
    }
}
