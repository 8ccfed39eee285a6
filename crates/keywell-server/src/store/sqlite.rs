use std::path::Path;

use keywell_crypto::{AgreementPublicKey, IdentityPublicKey, PreKeySignature};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{
    timestamp_now, BatchOutcome, Claim, Deadline, IdentityKeyRecord, KeyStore, NewOneTimePreKey,
    NewSignedPreKey, OneTimePreKeyRecord, SignedPreKeyRecord,
};
use crate::db::ConnectionPool;
use crate::error::StoreError;

/// [`KeyStore`] backed by `SQLite` through a [`ConnectionPool`].
///
/// Writes run in `BEGIN IMMEDIATE` transactions, which take the database
/// write lock up front. The one-time-key claim is a single conditional
/// `UPDATE … RETURNING`, so selecting a row and marking it used can never be
/// split by a concurrent claimer.
pub struct SqliteKeyStore {
    pool: ConnectionPool,
}

impl SqliteKeyStore {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, StoreError> {
        Ok(Self::new(ConnectionPool::open(path, pool_size)?))
    }

    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Interrupts and lock timeouts only happen once the deadline is spent.
fn classify(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked,
        ) => StoreError::DeadlineExceeded,
        _ => StoreError::Sqlite(err),
    }
}

fn corrupt(what: &str, user_id: Uuid, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what} for user {user_id}: {err}"))
}

fn upsert_signed_prekey(
    conn: &Connection,
    user_id: Uuid,
    signed_prekey: &NewSignedPreKey,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO signed_prekeys (user_id, key_id, public_key, signature, created_at, seq) \
         VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM signed_prekeys)) \
         ON CONFLICT(user_id, key_id) DO UPDATE SET \
             public_key = excluded.public_key, \
             signature = excluded.signature, \
             created_at = excluded.created_at, \
             seq = excluded.seq",
        params![
            user_id.to_string(),
            signed_prekey.key_id,
            signed_prekey.public_key.as_bytes().as_slice(),
            signed_prekey.signature.to_bytes().as_slice(),
            now,
        ],
    )
    .map_err(classify)?;
    Ok(())
}

fn insert_one_time_batch(
    conn: &Connection,
    user_id: Uuid,
    keys: &[NewOneTimePreKey],
    now: i64,
) -> Result<BatchOutcome, StoreError> {
    let mut outcome = BatchOutcome::default();
    if keys.is_empty() {
        return Ok(outcome);
    }

    let user = user_id.to_string();
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO one_time_prekeys (user_id, key_id, public_key, used, created_at) \
             VALUES (?1, ?2, ?3, 0, ?4) \
             ON CONFLICT(user_id, key_id) DO NOTHING",
        )
        .map_err(classify)?;

    for key in keys {
        let changed = stmt
            .execute(params![
                user,
                key.key_id,
                key.public_key.as_bytes().as_slice(),
                now,
            ])
            .map_err(classify)?;
        if changed == 0 {
            outcome.duplicates += 1;
        } else {
            outcome.inserted += 1;
        }
    }

    Ok(outcome)
}

impl KeyStore for SqliteKeyStore {
    fn publish_keys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        identity_key: &IdentityPublicKey,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError> {
        let mut conn = self.pool.checkout(deadline)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;
        let now = timestamp_now();

        tx.execute(
            "INSERT INTO identity_keys (user_id, public_key, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 public_key = excluded.public_key, \
                 created_at = excluded.created_at",
            params![user_id.to_string(), identity_key.to_bytes().as_slice(), now],
        )
        .map_err(classify)?;
        upsert_signed_prekey(&tx, user_id, signed_prekey, now)?;
        let outcome = insert_one_time_batch(&tx, user_id, one_time_prekeys, now)?;

        tx.commit().map_err(classify)?;
        Ok(outcome)
    }

    fn add_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
        signed_prekey: &NewSignedPreKey,
        one_time_prekeys: &[NewOneTimePreKey],
    ) -> Result<BatchOutcome, StoreError> {
        let mut conn = self.pool.checkout(deadline)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;
        let now = timestamp_now();

        upsert_signed_prekey(&tx, user_id, signed_prekey, now)?;
        let outcome = insert_one_time_batch(&tx, user_id, one_time_prekeys, now)?;

        tx.commit().map_err(classify)?;
        Ok(outcome)
    }

    fn identity_key(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<IdentityKeyRecord>, StoreError> {
        let conn = self.pool.checkout(deadline)?;
        let row = conn
            .query_row(
                "SELECT public_key, created_at FROM identity_keys WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(classify)?;

        row.map(|(public_key, created_at)| {
            Ok(IdentityKeyRecord {
                user_id,
                public_key: IdentityPublicKey::from_bytes(&public_key)
                    .map_err(|e| corrupt("identity key", user_id, e))?,
                created_at,
            })
        })
        .transpose()
    }

    fn latest_signed_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let conn = self.pool.checkout(deadline)?;
        let row = conn
            .query_row(
                "SELECT key_id, public_key, signature, created_at FROM signed_prekeys \
                 WHERE user_id = ?1 \
                 ORDER BY created_at DESC, seq DESC \
                 LIMIT 1",
                params![user_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(classify)?;

        row.map(|(key_id, public_key, signature, created_at)| {
            Ok(SignedPreKeyRecord {
                key_id,
                user_id,
                public_key: AgreementPublicKey::from_bytes(&public_key)
                    .map_err(|e| corrupt("signed pre-key", user_id, e))?,
                signature: PreKeySignature::from_bytes(&signature)
                    .map_err(|e| corrupt("signed pre-key signature", user_id, e))?,
                created_at,
            })
        })
        .transpose()
    }

    fn claim_one_time_prekey(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<Claim, StoreError> {
        let mut conn = self.pool.checkout(deadline)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;

        let row = tx
            .query_row(
                "UPDATE one_time_prekeys SET used = 1, claimed_at = ?2 \
                 WHERE rowid = ( \
                     SELECT rowid FROM one_time_prekeys \
                     WHERE user_id = ?1 AND used = 0 \
                     ORDER BY created_at, key_id \
                     LIMIT 1 \
                 ) \
                 RETURNING key_id, public_key, created_at",
                params![user_id.to_string(), timestamp_now()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(classify)?;

        tx.commit().map_err(classify)?;

        let Some((key_id, public_key, created_at)) = row else {
            return Ok(Claim::Exhausted);
        };
        // The row is consumed even if it fails to decode; it must not be
        // offered again either way.
        let public_key = AgreementPublicKey::from_bytes(&public_key)
            .map_err(|e| corrupt("one-time pre-key", user_id, e))?;

        Ok(Claim::Claimed(OneTimePreKeyRecord {
            key_id,
            user_id,
            public_key,
            used: true,
            created_at,
        }))
    }

    fn count_unused_one_time_prekeys(
        &self,
        deadline: &Deadline,
        user_id: Uuid,
    ) -> Result<u64, StoreError> {
        let conn = self.pool.checkout(deadline)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND used = 0",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
