use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::ZeroizeOnDrop;

use crate::keys::{AgreementPublicKey, IdentityPublicKey, PreKeySignature};

/// A user's Ed25519 identity key pair.
///
/// The directory itself only ever holds the public half. This type is the
/// client-side counterpart used to produce signed pre-keys for upload, and by
/// tests that exercise ingestion end to end.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey::from(self.signing_key.verifying_key())
    }

    /// Get the public key as raw bytes (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign an arbitrary message with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign a pre-key's raw public bytes, producing the value the directory
    /// checks on upload.
    pub fn sign_prekey(&self, prekey: &AgreementPublicKey) -> PreKeySignature {
        PreKeySignature::from(self.sign(prekey.as_bytes()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.public_key().fingerprint())
            .finish()
    }
}

/// An X25519 pre-key pair as generated by a client.
pub struct PreKeyPair {
    pub secret: StaticSecret,
    pub public: AgreementPublicKey,
}

impl PreKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = AgreementPublicKey::from(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = Identity::generate();
        let bytes = identity.signing_key.to_bytes();
        let restored = Identity::from_secret_bytes(&bytes);
        assert_eq!(identity.public_key(), restored.public_key());
    }

    #[test]
    fn prekey_pair_public_matches_secret() {
        let pair = PreKeyPair::generate();
        let derived = x25519_dalek::PublicKey::from(&pair.secret);
        assert_eq!(pair.public.as_bytes(), derived.as_bytes());
    }

    #[test]
    fn prekey_agreement_is_symmetric() {
        let alice = PreKeyPair::generate();
        let bob = PreKeyPair::generate();
        let bob_public = x25519_dalek::PublicKey::from(*bob.public.as_bytes());
        let alice_public = x25519_dalek::PublicKey::from(*alice.public.as_bytes());

        let shared_a = alice.secret.diffie_hellman(&bob_public);
        let shared_b = bob.secret.diffie_hellman(&alice_public);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn debug_never_prints_secret() {
        let identity = Identity::generate();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains(&identity.public_key().fingerprint()));
        assert!(!rendered.contains(&hex::encode(identity.signing_key.to_bytes())));
    }
}
