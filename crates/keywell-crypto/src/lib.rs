pub mod error;
pub mod identity;
pub mod keys;
pub mod verifier;

pub use error::CryptoError;
pub use identity::{Identity, PreKeyPair};
pub use keys::{AgreementPublicKey, IdentityPublicKey, PreKeySignature};
pub use verifier::{Ed25519Verifier, SignatureVerifier};
