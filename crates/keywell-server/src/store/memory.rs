//! In-memory [`KeyStore`].
//!
//! Suitable for tests and for embedding the directory where durability is not
//! needed. All tables sit behind one mutex, so every operation (including the
//! one-time-key claim) is a single critical section.

use std::collections::{BTreeMap, HashMap};

use keywell_crypto::IdentityPublicKey;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    timestamp_now, BatchOutcome, Claim, Deadline, IdentityKeyRecord, KeyStore, NewOneTimePreKey,
    NewSignedPreKey, OneTimePreKeyRecord, SignedPreKeyRecord,
};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryKeyStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    identity_keys: HashMap<Uuid, IdentityKeyRecord>,
    /// `(user, key_id)` -> (insertion sequence, row). The sequence breaks
    /// `created_at` ties the same way the `seq` column does in `SQLite`.
    signed_prekeys: BTreeMap<(Uuid, u32), (u64, SignedPreKeyRecord)>,
    one_time_prekeys: BTreeMap<(Uuid, u32), OneTimePreKeyRecord>,
    sequence: u64,
}

impl Tables {
    fn upsert_signed_prekey(&mut self, user_id: Uuid, signed_prekey: &NewSignedPreKey, now: i64) {
        self.sequence += 1;
        let record = SignedPreKeyRecord {
            key_id: signed_prekey.key_id,
            user_id,
            public_key: signed_prekey.public_key,
            signature: signed_prekey.signature,
            created_at: now,
        };
        self.signed_prekeys
            .insert((user_id, signed_prekey.key_id), (self.sequence, record));
    }

    fn insert_one_time_batch(
        &mut self,
        user_id: Uuid,
        keys: &[NewOneTimePreKey],
        now: i64,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for key in keys {
            let slot = (user_id, key.key_id);
            if self.one_time_prekeys.contains_key(&slot) {
                outcome.duplicates += 1;
                continue;
            }
            self.one_time_prekeys.insert(
                slot,
                OneTimePreKeyRecord {
                    key_id: key.key_id,
                    user_id,
                    public_key: key.public_key,
                    used: false,
                    created_at: now,
                },
            );
            outcome.inserted += 1;
        }
        outcome
    }

    fn one_time_for(
        &mut self,
        user_id: Uuid,
    ) -> impl Iterator<Item = &mut OneTimePreKeyRecord> + '_ {
        self.one_time_prekeys
            .range_mut((user_id, u32::MIN)..=(user_id, u32::MAX))
            .map(|(_, record)| record)
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn publish_keys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        identity_key: &IdentityPublicKey,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError> {
        deadline.check()?;
        let now = timestamp_now();
        let mut tables = self.tables.lock();

        tables.identity_keys.insert(
            user_id,
            IdentityKeyRecord {
                user_id,
                public_key: *identity_key,
                created_at: now,
            },
        );
        tables.upsert_signed_prekey(user_id, signed_prekey, now);
        Ok(tables.insert_one_time_batch(user_id, one_time_prekeys, now))
    }

    fn add_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError> {
        deadline.check()?;
        let now = timestamp_now();
        let mut tables = self.tables.lock();

        tables.upsert_signed_prekey(user_id, signed_prekey, now);
        Ok(tables.insert_one_time_batch(user_id, one_time_prekeys, now))
    }

    fn identity_key(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<IdentityKeyRecord>, StoreError> {
        deadline.check()?;
        Ok(self.tables.lock().identity_keys.get(&user_id).cloned())
    }

    fn latest_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        deadline.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .signed_prekeys
            .range((user_id, u32::MIN)..=(user_id, u32::MAX))
            .map(|(_, entry)| entry)
            .max_by_key(|(sequence, record)| (record.created_at, *sequence))
            .map(|(_, record)| record.clone()))
    }

    fn claim_one_time_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Claim, StoreError> {
        deadline.check()?;
        let mut tables = self.tables.lock();

        let claimed = tables
            .one_time_for(user_id)
            .filter(|record| !record.used)
            .min_by_key(|record| (record.created_at, record.key_id))
            .map(|record| {
                record.used = true;
                record.clone()
            });

        Ok(claimed.map_or(Claim::Exhausted, Claim::Claimed))
    }

    fn count_unused_one_time_prekeys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<u64, StoreError> {
        deadline.check()?;
        let mut tables = self.tables.lock();
        let unused = tables.one_time_for(user_id).filter(|r| !r.used).count();
        Ok(u64::try_from(unused).unwrap_or(u64::MAX))
    }
}
