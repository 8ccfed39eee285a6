//! Key upload and signed pre-key rotation.

use std::sync::Arc;

use keywell_crypto::{IdentityPublicKey, SignatureVerifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::store::{
    BatchOutcome, Deadline, KeyStore, Lookup, Missing, NewOneTimePreKey, NewSignedPreKey,
};

/// Everything a user publishes at registration (or re-registration).
#[derive(Debug, Clone)]
pub struct KeyUpload {
    pub identity_key: IdentityPublicKey,
    pub signed_prekey: NewSignedPreKey,
    pub one_time_prekeys: Vec<NewOneTimePreKey>,
}

/// A fresh signed pre-key, optionally with more one-time pre-keys.
#[derive(Debug, Clone)]
pub struct SignedPreKeyRotation {
    pub signed_prekey: NewSignedPreKey,
    pub one_time_prekeys: Vec<NewOneTimePreKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub one_time_inserted: usize,
    pub one_time_duplicates: usize,
}

impl From<BatchOutcome> for UploadReceipt {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            one_time_inserted: outcome.inserted,
            one_time_duplicates: outcome.duplicates,
        }
    }
}

/// Verifies and persists key material uploaded by its owner.
///
/// Nothing reaches the store until the signed pre-key's signature has been
/// checked, and each call's writes land in a single store transaction.
pub struct KeyIngestionService {
    store: Arc<dyn KeyStore>,
    verifier: Arc<dyn SignatureVerifier>,
    max_one_time_keys: usize,
}

impl KeyIngestionService {
    pub fn new(
        store: Arc<dyn KeyStore>,
        verifier: Arc<dyn SignatureVerifier>,
        config: &DirectoryConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            max_one_time_keys: config.max_one_time_keys_per_upload,
        }
    }

    /// Verify the signed pre-key against `upload.identity_key`, then upsert
    /// the identity key and insert the pre-keys.
    ///
    /// Retrying after a storage failure is safe: re-sent one-time key ids are
    /// skipped and the signed pre-key row is replaced in place.
    pub fn upload_keys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        upload: &KeyUpload,
    ) -> Result<UploadReceipt, DirectoryError> {
        self.check_batch_size(upload.one_time_prekeys.len())?;
        self.verify(&upload.identity_key, &upload.signed_prekey, user_id)?;

        let outcome = self.store.publish_keys(
            deadline,
            user_id,
            &upload.identity_key,
            &upload.signed_prekey,
            &upload.one_time_prekeys,
        )?;

        tracing::info!(
            user = %user_id,
            identity = %upload.identity_key.fingerprint(),
            signed_prekey_id = upload.signed_prekey.key_id,
            one_time_inserted = outcome.inserted,
            one_time_duplicates = outcome.duplicates,
            "keys uploaded"
        );
        Ok(outcome.into())
    }

    /// Add a new signed pre-key, verified against the identity key already on
    /// file. Older signed pre-keys stay in place for in-flight sessions.
    pub fn rotate_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        rotation: &SignedPreKeyRotation,
    ) -> Result<Lookup<UploadReceipt>, DirectoryError> {
        self.check_batch_size(rotation.one_time_prekeys.len())?;

        let Some(identity) = self.store.identity_key(deadline, user_id)? else {
            tracing::debug!(user = %user_id, "rotation rejected: no identity key on file");
            return Ok(Lookup::NotFound(Missing::IdentityKey));
        };
        self.verify(&identity.public_key, &rotation.signed_prekey, user_id)?;

        let outcome = self.store.add_signed_prekey(
            deadline,
            user_id,
            &rotation.signed_prekey,
            &rotation.one_time_prekeys,
        )?;

        tracing::info!(
            user = %user_id,
            signed_prekey_id = rotation.signed_prekey.key_id,
            one_time_inserted = outcome.inserted,
            "signed pre-key rotated"
        );
        Ok(Lookup::Found(outcome.into()))
    }

    fn check_batch_size(&self, len: usize) -> Result<(), DirectoryError> {
        if len > self.max_one_time_keys {
            return Err(DirectoryError::Validation(format!(
                "too many one-time pre-keys: {len} (limit {})",
                self.max_one_time_keys
            )));
        }
        Ok(())
    }

    fn verify(
        &self,
        identity_key: &IdentityPublicKey,
        signed_prekey: &NewSignedPreKey,
        user_id: Uuid,
    ) -> Result<(), DirectoryError> {
        self.verifier
            .verify_signed_prekey(
                identity_key,
                &signed_prekey.public_key,
                &signed_prekey.signature,
            )
            .map_err(|e| {
                tracing::warn!(
                    user = %user_id,
                    identity = %identity_key.fingerprint(),
                    signed_prekey_id = signed_prekey.key_id,
                    "signed pre-key signature rejected"
                );
                DirectoryError::InvalidSignature(e)
            })
    }
}
