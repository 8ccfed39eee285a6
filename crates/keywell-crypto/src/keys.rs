//! Fixed-length public key encodings accepted by the directory.
//!
//! Everything here is public material. Identity keys are Ed25519 verifying
//! keys, pre-keys are X25519 key-agreement keys, and signed pre-keys carry an
//! Ed25519 signature over the raw 32 pre-key bytes.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// Length of an X25519 public key.
pub const AGREEMENT_KEY_LENGTH: usize = 32;

fn decode_base64(field: &'static str, encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding {
            field,
            reason: e.to_string(),
        })
}

fn fixed<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidEncoding {
        field,
        reason: format!("expected {N} bytes, got {}", bytes.len()),
    })
}

/// Long-term Ed25519 public key identifying a user.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublicKey(VerifyingKey);

impl IdentityPublicKey {
    /// Parse 32 raw bytes. Rejects encodings that are not a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw = fixed::<PUBLIC_KEY_LENGTH>("identity_key", bytes)?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 identity key: {e}")))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_base64("identity_key", encoded)?)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl From<VerifyingKey> for IdentityPublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityPublicKey")
            .field(&self.fingerprint())
            .finish()
    }
}

/// X25519 public key used for key agreement (signed and one-time pre-keys).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgreementPublicKey(x25519_dalek::PublicKey);

impl AgreementPublicKey {
    /// Parse 32 raw bytes. The all-zero point is rejected since it forces a
    /// zero shared secret.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw = fixed::<AGREEMENT_KEY_LENGTH>("public_key", bytes)?;
        if raw == [0u8; AGREEMENT_KEY_LENGTH] {
            return Err(CryptoError::InvalidKey(
                "X25519 public key is the all-zero point".into(),
            ));
        }
        Ok(Self(x25519_dalek::PublicKey::from(raw)))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_base64("public_key", encoded)?)
    }

    pub fn as_bytes(&self) -> &[u8; AGREEMENT_KEY_LENGTH] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }
}

impl From<x25519_dalek::PublicKey> for AgreementPublicKey {
    fn from(key: x25519_dalek::PublicKey) -> Self {
        Self(key)
    }
}

/// Ed25519 signature by an identity key over a signed pre-key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreKeySignature(Signature);

impl PreKeySignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw = fixed::<SIGNATURE_LENGTH>("signature", bytes)?;
        Ok(Self(Signature::from_bytes(&raw)))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_base64("signature", encoded)?)
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.to_bytes())
    }

    pub fn signature(&self) -> &Signature {
        &self.0
    }
}

impl From<Signature> for PreKeySignature {
    fn from(signature: Signature) -> Self {
        Self(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Identity;

    #[test]
    fn identity_key_rejects_wrong_length() {
        let err = IdentityPublicKey::from_bytes(&[7u8; 31]).unwrap_err();
        let CryptoError::InvalidEncoding { field, .. } = err else {
            panic!("expected an encoding error");
        };
        assert_eq!(field, "identity_key");
    }

    #[test]
    fn identity_key_base64_matches_raw_bytes() {
        let identity = Identity::generate();
        let key = identity.public_key();
        let parsed = IdentityPublicKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.to_bytes(), identity.public_key_bytes());
    }

    #[test]
    fn malformed_base64_is_an_encoding_error() {
        let err = AgreementPublicKey::from_base64("not base64!!").unwrap_err();
        let CryptoError::InvalidEncoding { field, .. } = err else {
            panic!("expected an encoding error");
        };
        assert_eq!(field, "public_key");
    }

    #[test]
    fn agreement_key_rejects_zero_point() {
        assert!(matches!(
            AgreementPublicKey::from_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn signature_requires_64_bytes() {
        assert!(PreKeySignature::from_bytes(&[1u8; 63]).is_err());
        assert!(PreKeySignature::from_bytes(&[1u8; 64]).is_ok());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let key = Identity::generate().public_key();
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_eq!(key.fingerprint().len(), 16);
    }
}
