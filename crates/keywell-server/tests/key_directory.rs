//! End-to-end tests of the directory services over a real `SQLite` file.
//!
//! Uses real Ed25519 signatures and X25519 keys in a temp directory; nothing
//! is mocked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keywell_crypto::{Ed25519Verifier, Identity, PreKeyPair};
use keywell_server::store::{NewOneTimePreKey, NewSignedPreKey};
use keywell_server::{
    BundleAssemblyService, Deadline, DirectoryConfig, DirectoryError, KeyIngestionService,
    KeyStore, KeyUpload, Lookup, Missing, PreKeyBundle, SqliteKeyStore,
};
use uuid::Uuid;

struct Directory {
    _dir: tempfile::TempDir,
    ingestion: KeyIngestionService,
    bundles: BundleAssemblyService,
}

impl Directory {
    /// Fetch `user`'s bundle, which must exist.
    fn fetch(&self, user: Uuid) -> PreKeyBundle {
        self.bundles
            .get_bundle(&deadline(), user)
            .unwrap()
            .found()
            .unwrap()
    }
}

fn directory(pool_size: usize) -> Directory {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("keys.db");
    let store: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::open(&path, pool_size).unwrap());
    let config = DirectoryConfig::default();
    Directory {
        _dir: dir,
        ingestion: KeyIngestionService::new(Arc::clone(&store), Arc::new(Ed25519Verifier), &config),
        bundles: BundleAssemblyService::new(store, &config),
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(10))
}

fn signed_prekey(signer: &Identity, key_id: u32) -> NewSignedPreKey {
    let pair = PreKeyPair::generate();
    NewSignedPreKey {
        key_id,
        public_key: pair.public,
        signature: signer.sign_prekey(&pair.public),
    }
}

fn one_time_prekeys(ids: impl IntoIterator<Item = u32>) -> Vec<NewOneTimePreKey> {
    ids.into_iter()
        .map(|key_id| NewOneTimePreKey {
            key_id,
            public_key: PreKeyPair::generate().public,
        })
        .collect()
}

// ── Round trip ───────────────────────────────────────────────────────

#[test]
fn fetch_after_upload_returns_uploaded_keys() {
    let dir = directory(2);
    let user = Uuid::new_v4();
    let identity = Identity::generate();
    let upload = KeyUpload {
        identity_key: identity.public_key(),
        signed_prekey: signed_prekey(&identity, 1),
        one_time_prekeys: one_time_prekeys(1..=2),
    };

    dir.ingestion
        .upload_keys(&deadline(), user, &upload)
        .unwrap();
    let bundle = dir.fetch(user);

    let sent = &upload.signed_prekey;
    assert_eq!(bundle.user_id, user);
    assert_eq!(bundle.identity_key, upload.identity_key);
    assert_eq!(bundle.signed_prekey.key_id, sent.key_id);
    assert_eq!(bundle.signed_prekey.public_key, sent.public_key);
    assert_eq!(bundle.signed_prekey.signature, sent.signature);
}

// ── Rejection leaves no trace ────────────────────────────────────────

#[test]
fn rejected_upload_on_empty_directory_stays_not_found() {
    let dir = directory(1);
    let user = Uuid::new_v4();
    let identity = Identity::generate();
    let upload = KeyUpload {
        identity_key: identity.public_key(),
        signed_prekey: signed_prekey(&Identity::generate(), 1),
        one_time_prekeys: one_time_prekeys(1..=3),
    };

    let err = dir
        .ingestion
        .upload_keys(&deadline(), user, &upload)
        .unwrap_err();
    assert!(matches!(err, DirectoryError::InvalidSignature(_)));
    assert_eq!(
        dir.bundles.get_bundle(&deadline(), user).unwrap(),
        Lookup::NotFound(Missing::IdentityKey)
    );
}

#[test]
fn rejected_upload_keeps_previous_keys() {
    let dir = directory(1);
    let user = Uuid::new_v4();
    let original = Identity::generate();
    let good = KeyUpload {
        identity_key: original.public_key(),
        signed_prekey: signed_prekey(&original, 1),
        one_time_prekeys: Vec::new(),
    };
    dir.ingestion.upload_keys(&deadline(), user, &good).unwrap();

    let replacement = Identity::generate();
    let bad = KeyUpload {
        identity_key: replacement.public_key(),
        signed_prekey: signed_prekey(&original, 2),
        one_time_prekeys: one_time_prekeys(1..=5),
    };
    assert!(dir.ingestion.upload_keys(&deadline(), user, &bad).is_err());

    let bundle = dir.fetch(user);
    assert_eq!(bundle.identity_key, original.public_key());
    assert_eq!(bundle.signed_prekey.key_id, 1);
    assert!(bundle.one_time_prekey.is_none());
}

// ── Concurrency ──────────────────────────────────────────────────────

#[test]
fn concurrent_fetches_claim_each_key_exactly_once() {
    const KEYS: u32 = 24;

    let dir = directory(8);
    let user = Uuid::new_v4();
    let identity = Identity::generate();
    dir.ingestion
        .upload_keys(
            &deadline(),
            user,
            &KeyUpload {
                identity_key: identity.public_key(),
                signed_prekey: signed_prekey(&identity, 1),
                one_time_prekeys: one_time_prekeys(1..=KEYS),
            },
        )
        .unwrap();

    let claimed: Vec<u32> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..KEYS)
            .map(|_| {
                s.spawn(|| {
                    dir.bundles
                        .get_bundle(&deadline(), user)
                        .unwrap()
                        .found()
                        .unwrap()
                        .one_time_prekey
                        .expect("every fetch within the pool size gets a key")
                        .key_id
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let distinct: HashSet<u32> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), distinct.len(), "key issued twice");
    assert_eq!(distinct, (1..=KEYS).collect());

    let after = dir.fetch(user);
    assert!(after.one_time_prekey.is_none());
}

#[test]
fn more_fetchers_than_keys_degrade_without_errors() {
    let dir = directory(4);
    let user = Uuid::new_v4();
    let identity = Identity::generate();
    dir.ingestion
        .upload_keys(
            &deadline(),
            user,
            &KeyUpload {
                identity_key: identity.public_key(),
                signed_prekey: signed_prekey(&identity, 1),
                one_time_prekeys: one_time_prekeys(1..=5),
            },
        )
        .unwrap();

    let results: Vec<Option<u32>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..12)
            .map(|_| s.spawn(|| dir.fetch(user).one_time_prekey.map(|key| key.key_id)))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut issued: Vec<u32> = results.iter().flatten().copied().collect();
    issued.sort_unstable();
    assert_eq!(issued, vec![1, 2, 3, 4, 5]);
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), 7);
}

// ── Scenario: I1 / S1 / {O1, O2, O3} ─────────────────────────────────

#[test]
fn three_concurrent_fetches_then_one_without_one_time_key() {
    let dir = directory(4);
    let user = Uuid::new_v4();
    let i1 = Identity::generate();
    let s1 = signed_prekey(&i1, 1);
    let otks = one_time_prekeys([101, 102, 103]);
    dir.ingestion
        .upload_keys(
            &deadline(),
            user,
            &KeyUpload {
                identity_key: i1.public_key(),
                signed_prekey: s1.clone(),
                one_time_prekeys: otks.clone(),
            },
        )
        .unwrap();

    let fetched: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..3)
            .map(|_| s.spawn(|| dir.fetch(user)))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let ids: HashSet<u32> = fetched
        .iter()
        .map(|b| b.one_time_prekey.as_ref().unwrap().key_id)
        .collect();
    assert_eq!(ids, HashSet::from([101, 102, 103]));
    for bundle in &fetched {
        let otk = bundle.one_time_prekey.as_ref().unwrap();
        let uploaded = otks.iter().find(|k| k.key_id == otk.key_id).unwrap();
        assert_eq!(otk.public_key, uploaded.public_key);
    }

    let fourth = dir.fetch(user);
    assert_eq!(fourth.identity_key, i1.public_key());
    assert_eq!(fourth.signed_prekey.public_key, s1.public_key);
    assert!(fourth.one_time_prekey.is_none());
}

// ── Rotation ─────────────────────────────────────────────────────────

#[test]
fn rotated_signed_prekey_is_served_next() {
    let dir = directory(1);
    let user = Uuid::new_v4();
    let identity = Identity::generate();
    dir.ingestion
        .upload_keys(
            &deadline(),
            user,
            &KeyUpload {
                identity_key: identity.public_key(),
                signed_prekey: signed_prekey(&identity, 1),
                one_time_prekeys: Vec::new(),
            },
        )
        .unwrap();

    let rotated = signed_prekey(&identity, 2);
    let receipt = dir
        .ingestion
        .rotate_signed_prekey(
            &deadline(),
            user,
            &keywell_server::SignedPreKeyRotation {
                signed_prekey: rotated.clone(),
                one_time_prekeys: one_time_prekeys(1..=2),
            },
        )
        .unwrap()
        .found()
        .unwrap();
    assert_eq!(receipt.one_time_inserted, 2);

    let bundle = dir.fetch(user);
    assert_eq!(bundle.signed_prekey.key_id, 2);
    assert_eq!(bundle.signed_prekey.public_key, rotated.public_key);
}

#[test]
fn missing_signed_prekey_is_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = SqliteKeyStore::open(&dir.path().join("keys.db"), 1).unwrap();
    let user = Uuid::new_v4();
    {
        let conn = store.pool().checkout(&deadline()).unwrap();
        conn.execute(
            "INSERT INTO identity_keys (user_id, public_key, created_at) VALUES (?1, ?2, 0)",
            rusqlite::params![user.to_string(), Identity::generate().public_key_bytes().as_slice()],
        )
        .unwrap();
    }

    let bundles = BundleAssemblyService::new(Arc::new(store), &DirectoryConfig::default());
    assert_eq!(
        bundles.get_bundle(&deadline(), user).unwrap(),
        Lookup::NotFound(Missing::SignedPreKey)
    );
}
