//! AWS SDK client bundle, one KMS client per encryption region.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_kms::config::Region;

/// Per-region KMS clients sharing one credential chain.
///
/// Credentials are resolved once by [`aws_config`] and reused by every
/// regional client.
#[derive(Clone, Debug)]
pub struct AwsClients {
    kms: BTreeMap<String, aws_sdk_kms::Client>,
}

impl AwsClients {
    /// Build a KMS client for each of `regions`.
    ///
    /// # Errors
    ///
    /// Returns an error if `regions` is empty.
    pub async fn init(regions: &[String]) -> Result<Self> {
        anyhow::ensure!(!regions.is_empty(), "at least one region is required");

        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let kms = regions
            .iter()
            .map(|region| {
                let client = aws_sdk_kms::Client::from_conf(
                    aws_sdk_kms::config::Builder::from(&config)
                        .region(Region::new(region.clone()))
                        .build(),
                );
                (region.clone(), client)
            })
            .collect();

        Ok(Self { kms })
    }

    /// KMS client for `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if no client was built for `region`.
    pub fn kms(&self, region: &str) -> Result<&aws_sdk_kms::Client> {
        self.kms
            .get(region)
            .with_context(|| format!("no KMS client configured for region {region}"))
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.kms.keys().map(String::as_str)
    }
}
