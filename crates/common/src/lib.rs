//! Common domain types and errors shared across `sdb-vault` crates.

pub mod error;
pub mod model;

pub use error::ServiceError;
pub use model::{
    EncryptedBlob, GrantSubject, KeyMetadata, Page, PrincipalGrant, Role, SafeDepositBox,
    SecureData, SecureDataAction, SecureDataType, SecureDataVersion,
};
