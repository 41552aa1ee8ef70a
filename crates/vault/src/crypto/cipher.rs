//! AES-256-GCM-SIV sealing and opening of payloads under a data key.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! Every call still draws a fresh 96-bit nonce, and every record gets a fresh
//! data key, so a nonce is never reused under one key in practice.
//!
//! **Do NOT substitute plain AES-256-GCM with a fixed nonce.** GCM nonce reuse
//! is catastrophic: it breaks both confidentiality and authentication.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Sealing failed, or opening failed authentication (wrong key, wrong
    /// associated data, or tampered ciphertext).
    #[error("aead operation failed")]
    AeadFailure,
}

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext followed by the 16-byte authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(Sealed {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a [`Sealed`] payload, verifying it against `aad`.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails.
pub fn open(key: &[u8], sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&sealed.nonce);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::AeadFailure)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> Vec<u8> {
        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let sealed = seal(&key, b"{\"user\":\"a\"}", b"sdb/path").unwrap();
        assert_eq!(open(&key, &sealed, b"sdb/path").unwrap(), b"{\"user\":\"a\"}");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&random_key(), b"secret", b"").unwrap();
        assert_eq!(
            open(&random_key(), &sealed, b""),
            Err(CipherError::AeadFailure)
        );
    }

    #[test]
    fn wrong_aad_fails() {
        let key = random_key();
        let sealed = seal(&key, b"secret", b"sdb-a/db/creds").unwrap();
        assert!(open(&key, &sealed, b"sdb-b/db/creds").is_err());
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert_eq!(
            seal(&[0u8; 16], b"x", b"").unwrap_err(),
            CipherError::InvalidKeyLength
        );
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = random_key();
        let mut sealed = seal(&key, b"tamper me", b"").unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(open(&key, &sealed, b"").is_err());
    }
}
