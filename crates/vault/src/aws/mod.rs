//! AWS SDK wiring: regional KMS clients and the [`crate::kms::KmsProvider`]
//! implementation backed by them.

pub mod clients;
pub mod kms;

pub use clients::AwsClients;
pub use kms::AwsKmsProvider;
