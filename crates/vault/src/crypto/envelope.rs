//! Self-describing envelope format for encrypted secret payloads.
//!
//! ```text
//! v1.<b64url(header-json)>.<b64url(nonce)>.<b64url(ciphertext+tag)>
//! ```
//!
//! The header names the algorithm, the key scope and one wrapped copy of the
//! data key per region. The raw header segment and the caller's encryption
//! context are authenticated as associated data, so neither the wrapped keys
//! nor the record the blob belongs to can be swapped without failing the
//! integrity check.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::EncryptedBlob;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::cipher::{self, Sealed, NONCE_LEN};
use super::data_key::DataKey;
use super::EncryptionError;

/// Prefix that appears at the start of every envelope.
pub const VERSION_PREFIX: &str = "v1";

/// Payload algorithm recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES256-GCM-SIV")]
    Aes256GcmSiv,
}

/// One region's wrapped copy of the data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDataKey {
    pub region: String,
    /// Master key ARN that wrapped this copy.
    pub key_id: String,
    #[serde(with = "b64")]
    pub blob: Vec<u8>,
}

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub alg: Algorithm,
    pub scope: String,
    pub keys: Vec<WrappedDataKey>,
}

/// A parsed or freshly sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    header: EnvelopeHeader,
    /// Exact header bytes as written; authenticated as associated data.
    header_segment: String,
    sealed: Sealed,
}

impl Envelope {
    /// Encrypt `plaintext` under `data_key`, binding the header and `context`.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::MalformedEnvelope`] if the header cannot be
    /// serialised, or a cipher error if sealing fails.
    pub fn seal(
        header: EnvelopeHeader,
        data_key: &DataKey,
        plaintext: &[u8],
        context: &str,
    ) -> Result<Self, EncryptionError> {
        let header_json = serde_json::to_vec(&header)
            .map_err(|e| EncryptionError::MalformedEnvelope(e.to_string()))?;
        let header_segment = URL_SAFE_NO_PAD.encode(header_json);
        let aad = associated_data(&header_segment, context);
        let sealed = cipher::seal(data_key.as_bytes(), plaintext, &aad)?;
        Ok(Self {
            header,
            header_segment,
            sealed,
        })
    }

    /// Decrypt with an already unwrapped data key.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::IntegrityFailure`] if the ciphertext, the
    /// header or the context do not match what was sealed.
    pub fn open(
        &self,
        data_key: &DataKey,
        context: &str,
    ) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        let aad = associated_data(&self.header_segment, context);
        cipher::open(data_key.as_bytes(), &self.sealed, &aad)
            .map(Zeroizing::new)
            .map_err(|_| EncryptionError::IntegrityFailure)
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Canonical stored form.
    pub fn to_blob(&self) -> EncryptedBlob {
        EncryptedBlob::new(format!(
            "{}.{}.{}.{}",
            VERSION_PREFIX,
            self.header_segment,
            URL_SAFE_NO_PAD.encode(self.sealed.nonce),
            URL_SAFE_NO_PAD.encode(&self.sealed.ciphertext),
        ))
    }

    /// Parse a stored blob.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::MalformedEnvelope`] if the blob does not
    /// match the `v1.<header>.<nonce>.<ciphertext>` structure.
    pub fn parse(blob: &EncryptedBlob) -> Result<Self, EncryptionError> {
        let malformed = |reason: &str| EncryptionError::MalformedEnvelope(reason.to_owned());

        let text = std::str::from_utf8(blob.as_bytes()).map_err(|_| malformed("not utf-8"))?;
        let parts: Vec<&str> = text.splitn(4, '.').collect();
        if parts.len() != 4 || parts[0] != VERSION_PREFIX {
            return Err(malformed("unexpected structure or version"));
        }

        let header_json = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| malformed("header is not base64url"))?;
        let header: EnvelopeHeader =
            serde_json::from_slice(&header_json).map_err(|_| malformed("header is not valid"))?;
        if header.keys.is_empty() {
            return Err(malformed("no wrapped data keys"));
        }

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| malformed("nonce is not base64url"))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| malformed("nonce has the wrong length"))?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[3])
            .map_err(|_| malformed("ciphertext is not base64url"))?;

        Ok(Self {
            header,
            header_segment: parts[1].to_owned(),
            sealed: Sealed { nonce, ciphertext },
        })
    }
}

fn associated_data(header_segment: &str, context: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header_segment.len() + 1 + context.len());
    aad.extend_from_slice(header_segment.as_bytes());
    aad.push(0);
    aad.extend_from_slice(context.as_bytes());
    aad
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> EnvelopeHeader {
        EnvelopeHeader {
            alg: Algorithm::Aes256GcmSiv,
            scope: "sdb:abc".into(),
            keys: vec![WrappedDataKey {
                region: "us-west-2".into(),
                key_id: "arn:aws:kms:us-west-2:1:key/k1".into(),
                blob: vec![1, 2, 3],
            }],
        }
    }

    #[test]
    fn blob_round_trip_and_open() {
        let key = DataKey::generate();
        let env = Envelope::seal(header(), &key, b"hello", "abc/db/creds").unwrap();
        let blob = env.to_blob();
        assert!(blob.as_bytes().starts_with(b"v1."));

        let parsed = Envelope::parse(&blob).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(&*parsed.open(&key, "abc/db/creds").unwrap(), b"hello");
    }

    #[test]
    fn context_is_bound() {
        let key = DataKey::generate();
        let env = Envelope::seal(header(), &key, b"hello", "abc/db/creds").unwrap();
        assert!(matches!(
            env.open(&key, "abc/other"),
            Err(EncryptionError::IntegrityFailure)
        ));
    }

    #[test]
    fn swapped_header_fails_integrity() {
        let key = DataKey::generate();
        let env = Envelope::seal(header(), &key, b"hello", "ctx").unwrap();
        let blob = env.to_blob();
        let text = std::str::from_utf8(blob.as_bytes()).unwrap();
        let parts: Vec<&str> = text.split('.').collect();

        let mut other = header();
        other.scope = "sdb:other".into();
        let other_segment = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&other).unwrap());
        let forged = format!("v1.{other_segment}.{}.{}", parts[2], parts[3]);

        let parsed = Envelope::parse(&EncryptedBlob::new(forged)).unwrap();
        assert!(matches!(
            parsed.open(&key, "ctx"),
            Err(EncryptionError::IntegrityFailure)
        ));
    }

    #[test]
    fn malformed_blobs_rejected() {
        for bad in ["", "v2.a.b.c", "v1.abc", "v1.!!!.a.b", "v1.e30.AAAA.AAAA"] {
            let err = Envelope::parse(&EncryptedBlob::copy_from_slice(bad.as_bytes())).unwrap_err();
            assert!(
                matches!(err, EncryptionError::MalformedEnvelope(_)),
                "expected malformed for {bad:?}"
            );
        }
    }
}
