use keywell_crypto::CryptoError;
use thiserror::Error;

use crate::store::Missing;

/// Failures raised by a [`KeyStore`](crate::store::KeyStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's deadline passed while waiting for a connection, a lock,
    /// or a running statement. Any open transaction was rolled back.
    #[error("deadline exceeded before the store call completed")]
    DeadlineExceeded,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted row no longer decodes as valid key material.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("schema setup failed: {0}")]
    Schema(String),
}

/// Errors surfaced by the directory services.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Malformed input, rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The signed pre-key was not signed by the identity key.
    #[error("signed pre-key signature rejected: {0}")]
    InvalidSignature(#[source] CryptoError),

    #[error("{0} not found")]
    NotFound(Missing),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("replenishment notification failed: {0}")]
    Notify(String),
}

impl DirectoryError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
            Self::Notify(_) => "notification_error",
        }
    }
}

impl From<CryptoError> for DirectoryError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::VerificationError(_) => Self::InvalidSignature(err),
            CryptoError::InvalidEncoding { .. } | CryptoError::InvalidKey(_) => {
                Self::Validation(err.to_string())
            }
        }
    }
}
