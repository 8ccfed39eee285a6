use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encoding for {field}: {reason}")]
    InvalidEncoding { field: &'static str, reason: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("verification failed: {0}")]
    VerificationError(String),
}
