use crate::keys::{AgreementPublicKey, IdentityPublicKey, PreKeySignature};
use crate::CryptoError;

/// Checks that a signed pre-key was signed by the claimed identity key.
///
/// Runs before anything is persisted; a rejected upload must leave no state.
pub trait SignatureVerifier: Send + Sync {
    fn verify_signed_prekey(
        &self,
        identity_key: &IdentityPublicKey,
        prekey: &AgreementPublicKey,
        signature: &PreKeySignature,
    ) -> Result<(), CryptoError>;
}

/// Strict Ed25519 verification over the raw 32 pre-key bytes.
///
/// `verify_strict` rejects small-order identity keys and non-canonical
/// signatures, so one signature maps to exactly one accepted (key, message).
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_signed_prekey(
        &self,
        identity_key: &IdentityPublicKey,
        prekey: &AgreementPublicKey,
        signature: &PreKeySignature,
    ) -> Result<(), CryptoError> {
        identity_key
            .verifying_key()
            .verify_strict(prekey.as_bytes(), signature.signature())
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }
}
