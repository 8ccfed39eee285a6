//! Pre-key bundle assembly.

use std::sync::Arc;
use std::time::Duration;

use keywell_crypto::IdentityPublicKey;
use uuid::Uuid;

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::store::{
    timestamp_now, Claim, Deadline, KeyStore, Lookup, Missing, OneTimePreKeyRecord,
    SignedPreKeyRecord,
};

/// Public keys a requester needs to start an X3DH session with `user_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub user_id: Uuid,
    pub identity_key: IdentityPublicKey,
    pub signed_prekey: SignedPreKeyRecord,
    /// Absent when the user's one-time pool is exhausted. The session can
    /// still be established, with weaker forward secrecy for its first flight.
    pub one_time_prekey: Option<OneTimePreKeyRecord>,
}

/// Assembles bundles, consuming one one-time pre-key per fetch.
pub struct BundleAssemblyService {
    store: Arc<dyn KeyStore>,
    signed_prekey_max_age: Duration,
}

impl BundleAssemblyService {
    pub fn new(store: Arc<dyn KeyStore>, config: &DirectoryConfig) -> Self {
        Self {
            store,
            signed_prekey_max_age: config.signed_prekey_max_age,
        }
    }

    /// Fetch `target`'s bundle.
    ///
    /// Not idempotent: a claimed one-time pre-key stays consumed even if the
    /// caller never receives the bundle. A claimed key is never released back
    /// into the pool.
    pub fn get_bundle(
        &self,
        deadline: &Deadline,
        target: Uuid,
    ) -> Result<Lookup<PreKeyBundle>, DirectoryError> {
        let Some(identity) = self.store.identity_key(deadline, target)? else {
            return Ok(Lookup::NotFound(Missing::IdentityKey));
        };
        let Some(signed_prekey) = self.store.latest_signed_prekey(deadline, target)? else {
            return Ok(Lookup::NotFound(Missing::SignedPreKey));
        };
        self.warn_if_stale(&signed_prekey);

        let one_time_prekey = match self.store.claim_one_time_prekey(deadline, target)? {
            Claim::Claimed(key) => {
                tracing::debug!(
                    user = %target,
                    one_time_prekey_id = key.key_id,
                    "one-time pre-key claimed"
                );
                Some(key)
            }
            Claim::Exhausted => {
                tracing::info!(
                    user = %target,
                    "one-time pre-keys exhausted, serving bundle without one"
                );
                None
            }
        };

        Ok(Lookup::Found(PreKeyBundle {
            user_id: target,
            identity_key: identity.public_key,
            signed_prekey,
            one_time_prekey,
        }))
    }

    fn warn_if_stale(&self, signed_prekey: &SignedPreKeyRecord) {
        let age_ms = timestamp_now().saturating_sub(signed_prekey.created_at);
        let max_ms = i64::try_from(self.signed_prekey_max_age.as_millis()).unwrap_or(i64::MAX);
        if age_ms > max_ms {
            tracing::warn!(
                user = %signed_prekey.user_id,
                signed_prekey_id = signed_prekey.key_id,
                age_secs = age_ms / 1_000,
                "serving stale signed pre-key"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use keywell_crypto::{Ed25519Verifier, Identity, PreKeyPair};

    use super::*;
    use crate::ingestion::{KeyIngestionService, KeyUpload};
    use crate::store::{MemoryKeyStore, NewOneTimePreKey, NewSignedPreKey};

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn provision(
        store: &Arc<MemoryKeyStore>,
        user: Uuid,
        one_time: u32,
    ) -> (Identity, NewSignedPreKey) {
        let identity = Identity::generate();
        let pair = PreKeyPair::generate();
        let signed_prekey = NewSignedPreKey {
            key_id: 1,
            public_key: pair.public,
            signature: identity.sign_prekey(&pair.public),
        };
        let upload = KeyUpload {
            identity_key: identity.public_key(),
            signed_prekey: signed_prekey.clone(),
            one_time_prekeys: (1..=one_time)
                .map(|key_id| NewOneTimePreKey {
                    key_id,
                    public_key: PreKeyPair::generate().public,
                })
                .collect(),
        };
        KeyIngestionService::new(
            Arc::clone(store) as Arc<dyn KeyStore>,
            Arc::new(Ed25519Verifier),
            &DirectoryConfig::default(),
        )
        .upload_keys(&deadline(), user, &upload)
        .unwrap();
        (identity, signed_prekey)
    }

    #[test]
    fn unknown_user_is_not_found() {
        let svc = BundleAssemblyService::new(
            Arc::new(MemoryKeyStore::new()),
            &DirectoryConfig::default(),
        );
        assert_eq!(
            svc.get_bundle(&deadline(), Uuid::new_v4()).unwrap(),
            Lookup::NotFound(Missing::IdentityKey)
        );
    }

    #[test]
    fn bundle_carries_uploaded_keys() {
        let store = Arc::new(MemoryKeyStore::new());
        let user = Uuid::new_v4();
        let (identity, signed_prekey) = provision(&store, user, 1);
        let svc = BundleAssemblyService::new(store, &DirectoryConfig::default());

        let bundle = svc.get_bundle(&deadline(), user).unwrap().found().unwrap();
        assert_eq!(bundle.identity_key, identity.public_key());
        assert_eq!(bundle.signed_prekey.public_key, signed_prekey.public_key);
        assert_eq!(bundle.signed_prekey.signature, signed_prekey.signature);
        assert_eq!(bundle.one_time_prekey.map(|k| k.key_id), Some(1));
    }

    #[test]
    fn exhausted_pool_still_yields_bundle() {
        let store = Arc::new(MemoryKeyStore::new());
        let user = Uuid::new_v4();
        provision(&store, user, 1);
        let svc = BundleAssemblyService::new(store, &DirectoryConfig::default());

        let first = svc.get_bundle(&deadline(), user).unwrap().found().unwrap();
        assert!(first.one_time_prekey.is_some());
        let second = svc.get_bundle(&deadline(), user).unwrap().found().unwrap();
        assert!(second.one_time_prekey.is_none());
    }

    #[test]
    fn stale_signed_prekey_is_still_served() {
        let store = Arc::new(MemoryKeyStore::new());
        let user = Uuid::new_v4();
        provision(&store, user, 0);
        let config = DirectoryConfig {
            signed_prekey_max_age: Duration::ZERO,
            ..DirectoryConfig::default()
        };
        let svc = BundleAssemblyService::new(store, &config);

        assert!(svc.get_bundle(&deadline(), user).unwrap().found().is_some());
    }
}
