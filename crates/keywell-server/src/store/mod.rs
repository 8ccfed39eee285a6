//! Persistence for identity keys, signed pre-keys and one-time pre-keys.
//!
//! Two backends implement [`KeyStore`]: [`SqliteKeyStore`] for the daemon and
//! [`MemoryKeyStore`] for tests and embedding. Both guarantee that a one-time
//! pre-key is handed out at most once, no matter how many callers race for it.

mod memory;
mod sqlite;

use std::fmt;
use std::time::{Duration, Instant};

use keywell_crypto::{AgreementPublicKey, IdentityPublicKey, PreKeySignature};
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

/// Point in time after which a store call must give up and roll back.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    pub(crate) fn check(&self) -> Result<Duration, StoreError> {
        self.remaining().ok_or(StoreError::DeadlineExceeded)
    }
}

/// The user's current identity key. One row per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeyRecord {
    pub user_id: Uuid,
    pub public_key: IdentityPublicKey,
    /// UNIX milliseconds.
    pub created_at: i64,
}

/// A signed pre-key. Older rows are kept; bundles use the newest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    pub user_id: Uuid,
    pub public_key: AgreementPublicKey,
    pub signature: PreKeySignature,
    pub created_at: i64,
}

/// A single-use pre-key. `used` only ever moves from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePreKeyRecord {
    pub key_id: u32,
    pub user_id: Uuid,
    pub public_key: AgreementPublicKey,
    pub used: bool,
    pub created_at: i64,
}

/// Signed pre-key as submitted by its owner, signature already verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignedPreKey {
    pub key_id: u32,
    pub public_key: AgreementPublicKey,
    pub signature: PreKeySignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOneTimePreKey {
    pub key_id: u32,
    pub public_key: AgreementPublicKey,
}

/// Result of inserting a batch of one-time pre-keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Keys whose `key_id` already existed for the user and were left as-is.
    pub duplicates: usize,
}

/// Outcome of trying to take one unused one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The key is now marked used and belongs to this caller alone.
    Claimed(OneTimePreKeyRecord),
    /// The user has no unused one-time pre-keys left.
    Exhausted,
}

impl Claim {
    pub fn into_option(self) -> Option<OneTimePreKeyRecord> {
        match self {
            Self::Claimed(key) => Some(key),
            Self::Exhausted => None,
        }
    }
}

/// Which piece of a user's key material was absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    IdentityKey,
    SignedPreKey,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IdentityKey => "identity key",
            Self::SignedPreKey => "signed pre-key",
        })
    }
}

/// Tagged lookup result, so "user not provisioned" is a value and not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound(Missing),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound(_) => None,
        }
    }
}

/// Storage backend for the key directory.
///
/// Every call carries the caller's [`Deadline`]; a call that runs past it
/// fails with [`StoreError::DeadlineExceeded`] and leaves no partial writes.
pub trait KeyStore: Send + Sync {
    /// Upsert the identity key, insert the signed pre-key and the one-time
    /// batch, all in one transaction.
    fn publish_keys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        identity_key: &IdentityPublicKey,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError>;

    /// Insert a rotated signed pre-key plus an optional one-time batch, in
    /// one transaction. The identity key is left untouched.
    fn add_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError>;

    fn identity_key(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<IdentityKeyRecord>, StoreError>;

    /// The signed pre-key with the greatest `created_at`.
    fn latest_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    /// Atomically select one unused one-time pre-key and mark it used.
    fn claim_one_time_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Claim, StoreError>;

    fn count_unused_one_time_prekeys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<u64, StoreError>;
}

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
