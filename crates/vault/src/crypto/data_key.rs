//! [`DataKey`]: a single-use symmetric key for one envelope.

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use zeroize::Zeroizing;

use super::cipher::{CipherError, KEY_LEN};

/// Plaintext data key. Zeroed on drop, never printed.
///
/// A new key is generated for every encrypt call; keys are never shared
/// between records.
pub struct DataKey(Zeroizing<[u8; KEY_LEN]>);

impl DataKey {
    /// Draw a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Rebuild a key from unwrapped provider output.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] if `bytes` is not [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("DataKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = DataKey::generate();
        let b = DataKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(DataKey::from_slice(&[0u8; 16]).is_err());
        assert!(DataKey::from_slice(&[7u8; KEY_LEN]).is_ok());
    }

    #[test]
    fn redacted_in_debug() {
        let key = DataKey::from_slice(&[0xFFu8; KEY_LEN]).unwrap();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
