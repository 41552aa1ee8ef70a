//! Payload encryption primitives: the AEAD cipher, per-record data keys and
//! the stored envelope format.

pub mod cipher;
pub mod data_key;
pub mod envelope;

pub use cipher::{CipherError, KEY_LEN};
pub use data_key::DataKey;
pub use envelope::{Algorithm, Envelope, EnvelopeHeader, WrappedDataKey};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The stored blob is not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A master key could not be used to wrap or unwrap the data key.
    #[error("master key {key_id} in {region} unavailable: {reason}")]
    MasterKeyUnavailable {
        key_id: String,
        region: String,
        reason: String,
    },

    /// Authentication of the payload failed.
    #[error("integrity check failed")]
    IntegrityFailure,

    /// The key provider or metadata store failed while preparing keys.
    #[error("key provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}
