//! In-process [`KmsProvider`] that really wraps data keys.
//!
//! Each master key is a random AES-256 key held in memory. Wrapping seals the
//! data key with the master key and binds the key ARN as associated data, so
//! unwrapping with the wrong key fails the same way it would at the provider.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{KeyDescription, KeyPolicy, KmsError, KmsProvider, MasterKeyState};
use crate::crypto::cipher::{self, Sealed, NONCE_LEN};
use crate::crypto::DataKey;

const ACCOUNT_ID: &str = "000000000000";

struct MasterKey {
    material: DataKey,
    policy: String,
    state: MasterKeyState,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegionKeys {
    keys: BTreeMap<String, MasterKey>,
    aliases: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    regions: HashMap<String, RegionKeys>,
    unavailable: HashSet<String>,
    deletions: Vec<ScheduledDeletion>,
}

/// A recorded call to [`KmsProvider::schedule_key_deletion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDeletion {
    pub region: String,
    pub key_id: String,
    pub pending_days: u32,
}

/// Shared in-memory provider; clones see the same keys.
#[derive(Clone, Default)]
pub struct InMemoryKms {
    state: Arc<RwLock<State>>,
}

impl InMemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key with an arbitrary policy, as if created a day ago outside
    /// this service.
    pub async fn insert_key(&self, region: &str, policy_json: &str) -> String {
        let mut state = self.state.write().await;
        let key_id = new_key_arn(region);
        state.regions.entry(region.to_owned()).or_default().keys.insert(
            key_id.clone(),
            MasterKey {
                material: DataKey::generate(),
                policy: policy_json.to_owned(),
                state: MasterKeyState::Enabled,
                created_at: Utc::now() - Duration::days(1),
            },
        );
        key_id
    }

    /// Force a key into `state`; unknown keys are ignored.
    pub async fn set_key_state(&self, region: &str, key_id: &str, new_state: MasterKeyState) {
        let mut state = self.state.write().await;
        if let Some(key) = state
            .regions
            .get_mut(region)
            .and_then(|r| r.keys.get_mut(key_id))
        {
            key.state = new_state;
        }
    }

    /// Backdate a key's creation time; unknown keys are ignored.
    pub async fn set_key_created_at(&self, region: &str, key_id: &str, created_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(key) = state
            .regions
            .get_mut(region)
            .and_then(|r| r.keys.get_mut(key_id))
        {
            key.created_at = created_at;
        }
    }

    /// Make every call against `region` fail with a provider error.
    pub async fn set_region_available(&self, region: &str, available: bool) {
        let mut state = self.state.write().await;
        if available {
            state.unavailable.remove(region);
        } else {
            state.unavailable.insert(region.to_owned());
        }
    }

    pub async fn key_count(&self, region: &str) -> usize {
        let state = self.state.read().await;
        state.regions.get(region).map_or(0, |r| r.keys.len())
    }

    pub async fn scheduled_deletions(&self) -> Vec<ScheduledDeletion> {
        self.state.read().await.deletions.clone()
    }
}

fn new_key_arn(region: &str) -> String {
    format!("arn:aws:kms:{region}:{ACCOUNT_ID}:key/{}", uuid::Uuid::new_v4())
}

fn check_region(state: &State, region: &str) -> Result<(), KmsError> {
    if state.unavailable.contains(region) {
        return Err(KmsError::Provider(format!("{region} unavailable")));
    }
    Ok(())
}

fn usable_key<'a>(state: &'a State, region: &str, key_id: &str) -> Result<&'a MasterKey, KmsError> {
    check_region(state, region)?;
    let key = state
        .regions
        .get(region)
        .and_then(|r| r.keys.get(key_id))
        .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;
    if !key.state.is_usable() {
        return Err(KmsError::AccessDenied(format!("{key_id} is {:?}", key.state)));
    }
    Ok(key)
}

#[async_trait]
impl KmsProvider for InMemoryKms {
    async fn create_key(
        &self,
        region: &str,
        policy: &KeyPolicy,
        alias: &str,
    ) -> Result<String, KmsError> {
        let mut state = self.state.write().await;
        check_region(&state, region)?;
        let key_id = new_key_arn(region);
        let keys = state.regions.entry(region.to_owned()).or_default();
        // The key is created before the alias, so a lost alias race leaves an
        // untracked key behind, exactly like the real provider.
        keys.keys.insert(
            key_id.clone(),
            MasterKey {
                material: DataKey::generate(),
                policy: policy.to_json(),
                state: MasterKeyState::Enabled,
                created_at: Utc::now(),
            },
        );
        if keys.aliases.contains_key(alias) {
            return Err(KmsError::AlreadyExists(alias.to_owned()));
        }
        keys.aliases.insert(alias.to_owned(), key_id.clone());
        Ok(key_id)
    }

    async fn encrypt(
        &self,
        region: &str,
        key_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let state = self.state.read().await;
        let key = usable_key(&state, region, key_id)?;
        let sealed = cipher::seal(key.material.as_bytes(), plaintext, key_id.as_bytes())
            .map_err(|e| KmsError::Provider(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len());
        out.extend_from_slice(&sealed.nonce);
        out.extend_from_slice(&sealed.ciphertext);
        Ok(out)
    }

    async fn decrypt(
        &self,
        region: &str,
        key_id: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let state = self.state.read().await;
        let key = usable_key(&state, region, key_id)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(KmsError::InvalidCiphertext(key_id.to_owned()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let sealed = Sealed {
            nonce: nonce
                .try_into()
                .map_err(|_| KmsError::InvalidCiphertext(key_id.to_owned()))?,
            ciphertext: body.to_vec(),
        };
        cipher::open(key.material.as_bytes(), &sealed, key_id.as_bytes())
            .map_err(|_| KmsError::InvalidCiphertext(key_id.to_owned()))
    }

    async fn list_keys(&self, region: &str) -> Result<Vec<String>, KmsError> {
        let state = self.state.read().await;
        check_region(&state, region)?;
        Ok(state
            .regions
            .get(region)
            .map(|r| r.keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_key_policy(&self, region: &str, key_id: &str) -> Result<String, KmsError> {
        let state = self.state.read().await;
        check_region(&state, region)?;
        state
            .regions
            .get(region)
            .and_then(|r| r.keys.get(key_id))
            .map(|k| k.policy.clone())
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))
    }

    async fn describe_key(
        &self,
        region: &str,
        key_id: &str,
    ) -> Result<KeyDescription, KmsError> {
        let state = self.state.read().await;
        check_region(&state, region)?;
        Ok(state
            .regions
            .get(region)
            .and_then(|r| r.keys.get(key_id))
            .map_or_else(KeyDescription::missing, |k| KeyDescription {
                state: k.state,
                created_at: Some(k.created_at),
            }))
    }

    async fn schedule_key_deletion(
        &self,
        region: &str,
        key_id: &str,
        pending_days: u32,
    ) -> Result<(), KmsError> {
        let mut state = self.state.write().await;
        check_region(&state, region)?;
        let key = state
            .regions
            .get_mut(region)
            .and_then(|r| r.keys.get_mut(key_id))
            .ok_or_else(|| KmsError::NotFound(key_id.to_owned()))?;
        key.state = MasterKeyState::PendingDeletion;
        state.deletions.push(ScheduledDeletion {
            region: region.to_owned(),
            key_id: key_id.to_owned(),
            pending_days,
        });
        Ok(())
    }
}
