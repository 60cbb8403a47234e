//! ProtocolStore — durable storage for all cryptographic material.
//!
//! SQLite via sqlx. WAL journal mode and foreign-key enforcement are
//! configured at connection time here — NOT inside a migration, because
//! SQLite forbids changing `journal_mode` inside a transaction and sqlx
//! wraps every migration in one.
//!
//! Guarantees the engine relies on:
//! - `claim_one_time_prekey` is a row-level compare-and-set; two concurrent
//!   bundle fetches can never claim the same key.
//! - `rotate_signed_prekey` and `save_initial_keys` are transactional.
//! - `save_one_time_prekeys` is all-or-nothing; duplicate key ids roll the
//!   whole batch back as a `Conflict`.
//! - Every operation runs under a bounded timeout; an elapsed timeout
//!   surfaces `Unavailable` and leaves no partial mutation behind.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{
    cache::{SessionCache, SessionKey},
    error::StoreError,
    models::{
        IdentityRow, OneTimePreKeyRow, RemoteIdentityRow, SignedPreKeyRow, TrustState,
    },
};

/// Outcome of recording an observed remote identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityObservation {
    /// First contact; stored as UNTRUSTED.
    First,
    /// Same key as before; no transition.
    Unchanged,
    /// Key differs from the stored one; trust moved to CHANGED.
    Changed,
}

/// Central store handle. Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct ProtocolStore {
    pub pool: SqlitePool,
    cache: std::sync::Arc<SessionCache>,
    op_timeout: Duration,
}

impl ProtocolStore {
    /// Open (or create) the SQLite database at `db_path` and run migrations.
    pub async fn open(
        db_path: &Path,
        op_timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self {
            pool,
            cache: std::sync::Arc::new(SessionCache::new(cache_ttl)),
            op_timeout,
        })
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Unavailable)?
    }

    // ── Identity keys ────────────────────────────────────────────────────────

    pub async fn save_identity(&self, row: &IdentityRow) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO identity_keys \
                 (user_id, device_id, public_key, sealed_private_key, registration_id, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.user_id)
            .bind(row.device_id)
            .bind(&row.public_key)
            .bind(&row.sealed_private_key)
            .bind(row.registration_id)
            .bind(row.created_at)
            .bind(row.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(e, "identity key"))?;
            Ok(())
        })
        .await
    }

    pub async fn load_active_identity(
        &self,
        user_id: &str,
        device_id: i64,
    ) -> Result<Option<IdentityRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, IdentityRow>(
                "SELECT * FROM identity_keys \
                 WHERE user_id = ? AND device_id = ? \
                   AND (expires_at IS NULL OR expires_at > ?) \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(user_id)
            .bind(device_id)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    pub async fn delete_identity(&self, user_id: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM identity_keys WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn users_with_identity(&self) -> Result<Vec<String>, StoreError> {
        self.timed(async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT user_id FROM identity_keys")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(u,)| u).collect())
        })
        .await
    }

    // ── Signed prekeys ───────────────────────────────────────────────────────

    pub async fn save_signed_prekey(&self, row: &SignedPreKeyRow) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO signed_prekeys \
                 (user_id, key_id, public_key, sealed_private_key, signature, created_at, expires_at, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.user_id)
            .bind(row.key_id)
            .bind(&row.public_key)
            .bind(&row.sealed_private_key)
            .bind(&row.signature)
            .bind(row.created_at)
            .bind(row.expires_at)
            .bind(row.active)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(e, "signed prekey"))?;
            Ok(())
        })
        .await
    }

    pub async fn load_active_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<SignedPreKeyRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, SignedPreKeyRow>(
                "SELECT * FROM signed_prekeys WHERE user_id = ? AND active = 1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Load a signed prekey by id — active or still inside its overlap
    /// window — so in-flight handshakes against the previous key succeed.
    pub async fn load_signed_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<Option<SignedPreKeyRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, SignedPreKeyRow>(
                "SELECT * FROM signed_prekeys \
                 WHERE user_id = ? AND key_id = ? \
                   AND (active = 1 OR expires_at IS NULL OR expires_at > ?)",
            )
            .bind(user_id)
            .bind(key_id)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Atomically demote the current active signed prekey (it stays readable
    /// until `demoted_expires_at`) and install the new one as active.
    pub async fn rotate_signed_prekey(
        &self,
        user_id: &str,
        new_row: &SignedPreKeyRow,
        demoted_expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE signed_prekeys SET active = 0, expires_at = ? \
                 WHERE user_id = ? AND active = 1",
            )
            .bind(demoted_expires_at)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO signed_prekeys \
                 (user_id, key_id, public_key, sealed_private_key, signature, created_at, expires_at, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
            )
            .bind(&new_row.user_id)
            .bind(new_row.key_id)
            .bind(&new_row.public_key)
            .bind(&new_row.sealed_private_key)
            .bind(&new_row.signature)
            .bind(new_row.created_at)
            .bind(new_row.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_insert(e, "signed prekey"))?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn max_signed_prekey_id(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        self.timed(async {
            let max: Option<i64> =
                sqlx::query_scalar("SELECT MAX(key_id) FROM signed_prekeys WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(max)
        })
        .await
    }

    pub async fn delete_signed_prekeys(&self, user_id: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM signed_prekeys WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Users whose active signed prekey predates `cutoff` (rotation sweep).
    pub async fn users_with_stale_signed_prekey(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.timed(async {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT user_id FROM signed_prekeys WHERE active = 1 AND created_at < ?",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(u,)| u).collect())
        })
        .await
    }

    /// Purge demoted signed prekeys whose overlap window has closed.
    pub async fn purge_expired_signed_prekeys(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.timed(async {
            let res = sqlx::query(
                "DELETE FROM signed_prekeys WHERE active = 0 AND expires_at IS NOT NULL AND expires_at < ?",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected())
        })
        .await
    }

    // ── One-time prekeys ─────────────────────────────────────────────────────

    /// All-or-nothing batch insert. Any duplicate (user, key_id) rolls the
    /// whole batch back and surfaces `Conflict`.
    pub async fn save_one_time_prekeys(
        &self,
        rows: &[OneTimePreKeyRow],
    ) -> Result<(), StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;
            for row in rows {
                sqlx::query(
                    "INSERT INTO one_time_prekeys \
                     (user_id, key_id, public_key, sealed_private_key, created_at, expires_at, used, used_at) \
                     VALUES (?, ?, ?, ?, ?, ?, 0, NULL)",
                )
                .bind(&row.user_id)
                .bind(row.key_id)
                .bind(&row.public_key)
                .bind(&row.sealed_private_key)
                .bind(row.created_at)
                .bind(row.expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_insert(e, "one-time prekey"))?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Linearizable claim: compare-and-set `used` 0→1 on the lowest
    /// available key. Concurrent claimers each get a distinct row or
    /// nothing. `None` is not an error — the bundle simply omits the key.
    pub async fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<OneTimePreKeyRow>, StoreError> {
        self.timed(async {
            let now = Utc::now();
            let row = sqlx::query_as::<_, OneTimePreKeyRow>(
                "UPDATE one_time_prekeys SET used = 1, used_at = ? \
                 WHERE user_id = ? AND used = 0 AND key_id = ( \
                     SELECT key_id FROM one_time_prekeys \
                     WHERE user_id = ? AND used = 0 \
                       AND (expires_at IS NULL OR expires_at > ?) \
                     ORDER BY key_id ASC LIMIT 1 \
                 ) \
                 RETURNING *",
            )
            .bind(now)
            .bind(user_id)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Load a one-time prekey row regardless of claim state; the acceptance
    /// path needs the private half of a key that was claimed at bundle time.
    pub async fn load_one_time_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<Option<OneTimePreKeyRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, OneTimePreKeyRow>(
                "SELECT * FROM one_time_prekeys WHERE user_id = ? AND key_id = ?",
            )
            .bind(user_id)
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Irrevocably consume a one-time prekey's private half after a
    /// successful handshake. The row stays (used = 1) so the key id can
    /// never be re-emitted.
    pub async fn consume_one_time_prekey(
        &self,
        user_id: &str,
        key_id: i64,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE one_time_prekeys \
                 SET sealed_private_key = NULL, used = 1, used_at = COALESCE(used_at, ?) \
                 WHERE user_id = ? AND key_id = ?",
            )
            .bind(Utc::now())
            .bind(user_id)
            .bind(key_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn count_available_one_time_prekeys(&self, user_id: &str) -> Result<i64, StoreError> {
        self.timed(async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM one_time_prekeys \
                 WHERE user_id = ? AND used = 0 AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(user_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        })
        .await
    }

    pub async fn max_one_time_prekey_id(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        self.timed(async {
            let max: Option<i64> =
                sqlx::query_scalar("SELECT MAX(key_id) FROM one_time_prekeys WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(max)
        })
        .await
    }

    pub async fn delete_one_time_prekeys(&self, user_id: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM one_time_prekeys WHERE user_id = ?")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Purge used one-time prekeys older than the grace cutoff.
    pub async fn purge_used_one_time_prekeys(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.timed(async {
            let res = sqlx::query(
                "DELETE FROM one_time_prekeys \
                 WHERE used = 1 AND used_at IS NOT NULL AND used_at < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(res.rows_affected())
        })
        .await
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub async fn load_session(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let key: SessionKey = (owner.to_string(), peer.to_string(), device);
        if let Some(record) = self.cache.get(&key) {
            return Ok(Some(record));
        }
        self.timed(async {
            let record: Option<(Vec<u8>,)> = sqlx::query_as(
                "SELECT sealed_session_record FROM sessions \
                 WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
            )
            .bind(owner)
            .bind(peer)
            .bind(device)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((ref bytes,)) = record {
                self.cache.put(key, bytes.clone());
            }
            Ok(record.map(|(b,)| b))
        })
        .await
    }

    /// Upsert the session record and bump `last_used_at`. The cached copy is
    /// invalidated before the write so readers never see a stale record.
    pub async fn save_session(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        record: &[u8],
    ) -> Result<(), StoreError> {
        let key: SessionKey = (owner.to_string(), peer.to_string(), device);
        self.cache.invalidate(&key);
        self.timed(async {
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO sessions \
                 (owner_user_id, peer_user_id, peer_device_id, sealed_session_record, created_at, last_used_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (owner_user_id, peer_user_id, peer_device_id) DO UPDATE \
                     SET sealed_session_record = excluded.sealed_session_record, \
                         last_used_at = excluded.last_used_at",
            )
            .bind(owner)
            .bind(peer)
            .bind(device)
            .bind(record)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            self.cache.put(key, record.to_vec());
            Ok(())
        })
        .await
    }

    pub async fn delete_session(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
    ) -> Result<(), StoreError> {
        let key: SessionKey = (owner.to_string(), peer.to_string(), device);
        self.cache.invalidate(&key);
        self.timed(async {
            sqlx::query(
                "DELETE FROM sessions \
                 WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
            )
            .bind(owner)
            .bind(peer)
            .bind(device)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_sessions_for_owner(&self, owner: &str) -> Result<(), StoreError> {
        self.cache.invalidate_owner(owner);
        self.timed(async {
            sqlx::query("DELETE FROM sessions WHERE owner_user_id = ?")
                .bind(owner)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn has_session(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
    ) -> Result<bool, StoreError> {
        Ok(self.load_session(owner, peer, device).await?.is_some())
    }

    /// Purge sessions idle since before `cutoff`.
    pub async fn purge_idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.timed(async {
            let res = sqlx::query("DELETE FROM sessions WHERE last_used_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected())
        })
        .await
    }

    // ── Remote identities ────────────────────────────────────────────────────

    pub async fn load_remote_identity(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
    ) -> Result<Option<RemoteIdentityRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, RemoteIdentityRow>(
                "SELECT * FROM remote_identities \
                 WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
            )
            .bind(owner)
            .bind(peer)
            .bind(device)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Record an observed identity key for (owner → peer, device).
    ///
    /// MITM rule: a key change moves trust to CHANGED and stores the new key
    /// as current; a trusted key is never silently replaced.
    pub async fn upsert_remote_identity(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        peer_public_key: &[u8],
    ) -> Result<IdentityObservation, StoreError> {
        self.timed(async {
            let existing = sqlx::query_as::<_, RemoteIdentityRow>(
                "SELECT * FROM remote_identities \
                 WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
            )
            .bind(owner)
            .bind(peer)
            .bind(device)
            .fetch_optional(&self.pool)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        "INSERT INTO remote_identities \
                         (owner_user_id, peer_user_id, peer_device_id, peer_public_key, trust, first_seen_at) \
                         VALUES (?, ?, ?, ?, 'untrusted', ?)",
                    )
                    .bind(owner)
                    .bind(peer)
                    .bind(device)
                    .bind(peer_public_key)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                    Ok(IdentityObservation::First)
                }
                Some(row) if row.peer_public_key == peer_public_key => {
                    Ok(IdentityObservation::Unchanged)
                }
                Some(_) => {
                    sqlx::query(
                        "UPDATE remote_identities SET peer_public_key = ?, trust = 'changed' \
                         WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
                    )
                    .bind(peer_public_key)
                    .bind(owner)
                    .bind(peer)
                    .bind(device)
                    .execute(&self.pool)
                    .await?;
                    Ok(IdentityObservation::Changed)
                }
            }
        })
        .await
    }

    pub async fn set_trust(
        &self,
        owner: &str,
        peer: &str,
        device: i64,
        trust: TrustState,
    ) -> Result<(), StoreError> {
        self.timed(async {
            let res = sqlx::query(
                "UPDATE remote_identities SET trust = ?, last_verified_at = ? \
                 WHERE owner_user_id = ? AND peer_user_id = ? AND peer_device_id = ?",
            )
            .bind(trust)
            .bind(Utc::now())
            .bind(owner)
            .bind(peer)
            .bind(device)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("remote identity {owner}→{peer}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_remote_identities(&self, owner: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM remote_identities WHERE owner_user_id = ?")
                .bind(owner)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    // ── Audit & rotation history ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn append_audit(
        &self,
        user_id: &str,
        op: &str,
        peer_user_id: Option<&str>,
        success: bool,
        error_kind: Option<&str>,
        latency_nanos: i64,
        metadata: Option<&str>,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO audit_log \
                 (user_id, op, peer_user_id, success, error_kind, latency_nanos, metadata, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(op)
            .bind(peer_user_id)
            .bind(success)
            .bind(error_kind)
            .bind(latency_nanos)
            .bind(metadata)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Failed operations by this user since `since` (suspicious-activity
    /// detection window).
    pub async fn count_recent_failures(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.timed(async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM audit_log \
                 WHERE user_id = ? AND success = 0 AND created_at > ?",
            )
            .bind(user_id)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        })
        .await
    }

    pub async fn append_key_rotation(
        &self,
        user_id: &str,
        key_kind: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO key_rotation_history (user_id, key_kind, rotated_at, reason) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(key_kind)
            .bind(Utc::now())
            .bind(reason)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Most recent rotation of `key_kind` for the user, if any. The
    /// scheduler uses this to avoid over-rotating.
    pub async fn last_key_rotation(
        &self,
        user_id: &str,
        key_kind: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.timed(async {
            let at: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT MAX(rotated_at) FROM key_rotation_history \
                 WHERE user_id = ? AND key_kind = ?",
            )
            .bind(user_id)
            .bind(key_kind)
            .fetch_one(&self.pool)
            .await?;
            Ok(at)
        })
        .await
    }

    // ── Initial key generation ───────────────────────────────────────────────

    /// Persist a freshly generated key set in one transaction: identity,
    /// signed prekey, and the one-time prekey batch all land or none do.
    pub async fn save_initial_keys(
        &self,
        identity: &IdentityRow,
        signed_prekey: &SignedPreKeyRow,
        one_time_prekeys: &[OneTimePreKeyRow],
    ) -> Result<(), StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO identity_keys \
                 (user_id, device_id, public_key, sealed_private_key, registration_id, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&identity.user_id)
            .bind(identity.device_id)
            .bind(&identity.public_key)
            .bind(&identity.sealed_private_key)
            .bind(identity.registration_id)
            .bind(identity.created_at)
            .bind(identity.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_insert(e, "identity key"))?;

            sqlx::query(
                "INSERT INTO signed_prekeys \
                 (user_id, key_id, public_key, sealed_private_key, signature, created_at, expires_at, active) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
            )
            .bind(&signed_prekey.user_id)
            .bind(signed_prekey.key_id)
            .bind(&signed_prekey.public_key)
            .bind(&signed_prekey.sealed_private_key)
            .bind(&signed_prekey.signature)
            .bind(signed_prekey.created_at)
            .bind(signed_prekey.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_insert(e, "signed prekey"))?;

            for row in one_time_prekeys {
                sqlx::query(
                    "INSERT INTO one_time_prekeys \
                     (user_id, key_id, public_key, sealed_private_key, created_at, expires_at, used, used_at) \
                     VALUES (?, ?, ?, ?, ?, ?, 0, NULL)",
                )
                .bind(&row.user_id)
                .bind(row.key_id)
                .bind(&row.public_key)
                .bind(&row.sealed_private_key)
                .bind(row.created_at)
                .bind(row.expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_insert(e, "one-time prekey"))?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_temp() -> (ProtocolStore, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/cupid-store-test-{}.db", Uuid::new_v4()));
        let store = ProtocolStore::open(
            &db_path,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
        .await
        .expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    fn otpk(user: &str, key_id: i64) -> OneTimePreKeyRow {
        OneTimePreKeyRow {
            user_id: user.into(),
            key_id,
            public_key: vec![key_id as u8; 32],
            sealed_private_key: Some(vec![0xAA; 64]),
            created_at: Utc::now(),
            expires_at: None,
            used: false,
            used_at: None,
        }
    }

    fn identity(user: &str) -> IdentityRow {
        IdentityRow {
            user_id: user.into(),
            device_id: 1,
            public_key: vec![1u8; 33],
            sealed_private_key: vec![2u8; 64],
            registration_id: 42,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn spk(user: &str, key_id: i64, active: bool) -> SignedPreKeyRow {
        SignedPreKeyRow {
            user_id: user.into(),
            key_id,
            public_key: vec![3u8; 32],
            sealed_private_key: vec![4u8; 64],
            signature: vec![5u8; 64],
            created_at: Utc::now(),
            expires_at: None,
            active,
        }
    }

    #[tokio::test]
    async fn duplicate_identity_is_a_conflict() {
        let (store, path) = open_temp().await;
        store.save_identity(&identity("alice")).await.unwrap();
        assert!(matches!(
            store.save_identity(&identity("alice")).await,
            Err(StoreError::Conflict(_))
        ));
        cleanup(&path);
    }

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_the_same_key() {
        let (store, path) = open_temp().await;
        store
            .save_one_time_prekeys(&(0..10).map(|i| otpk("bob", i)).collect::<Vec<_>>())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_one_time_prekey("bob").await.unwrap()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            if let Some(row) = h.await.unwrap() {
                assert!(seen.insert(row.key_id), "key {} claimed twice", row.key_id);
            }
        }
        assert_eq!(seen.len(), 10);
        // Exhausted: the next claim comes back empty, never a reused key.
        assert!(store.claim_one_time_prekey("bob").await.unwrap().is_none());
        assert_eq!(store.count_available_one_time_prekeys("bob").await.unwrap(), 0);
        cleanup(&path);
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let (store, path) = open_temp().await;
        store.save_one_time_prekeys(&[otpk("bob", 0)]).await.unwrap();

        // key 0 collides → the whole batch must roll back.
        let batch = vec![otpk("bob", 1), otpk("bob", 0), otpk("bob", 2)];
        assert!(matches!(
            store.save_one_time_prekeys(&batch).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.count_available_one_time_prekeys("bob").await.unwrap(), 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn rotation_keeps_exactly_one_active() {
        let (store, path) = open_temp().await;
        store.save_signed_prekey(&spk("alice", 1, true)).await.unwrap();

        let overlap_end = Utc::now() + chrono::Duration::days(7);
        store
            .rotate_signed_prekey("alice", &spk("alice", 2, true), overlap_end)
            .await
            .unwrap();

        let active = store.load_active_signed_prekey("alice").await.unwrap().unwrap();
        assert_eq!(active.key_id, 2);
        // The demoted key stays loadable inside its overlap window.
        let old = store.load_signed_prekey("alice", 1).await.unwrap().unwrap();
        assert!(!old.active);
        assert!(old.expires_at.is_some());
        cleanup(&path);
    }

    #[tokio::test]
    async fn remote_identity_change_flips_trust_to_changed() {
        let (store, path) = open_temp().await;
        let first = store
            .upsert_remote_identity("alice", "bob", 1, &[1u8; 33])
            .await
            .unwrap();
        assert_eq!(first, IdentityObservation::First);

        store.set_trust("alice", "bob", 1, TrustState::Trusted).await.unwrap();

        let same = store
            .upsert_remote_identity("alice", "bob", 1, &[1u8; 33])
            .await
            .unwrap();
        assert_eq!(same, IdentityObservation::Unchanged);

        let changed = store
            .upsert_remote_identity("alice", "bob", 1, &[9u8; 33])
            .await
            .unwrap();
        assert_eq!(changed, IdentityObservation::Changed);

        let row = store.load_remote_identity("alice", "bob", 1).await.unwrap().unwrap();
        assert_eq!(row.trust, TrustState::Changed);
        assert_eq!(row.peer_public_key, vec![9u8; 33]);
        cleanup(&path);
    }

    #[tokio::test]
    async fn session_upsert_and_delete_round_trip_through_cache() {
        let (store, path) = open_temp().await;
        assert!(store.load_session("alice", "bob", 1).await.unwrap().is_none());

        store.save_session("alice", "bob", 1, b"state-1").await.unwrap();
        assert_eq!(
            store.load_session("alice", "bob", 1).await.unwrap().unwrap(),
            b"state-1"
        );

        store.save_session("alice", "bob", 1, b"state-2").await.unwrap();
        assert_eq!(
            store.load_session("alice", "bob", 1).await.unwrap().unwrap(),
            b"state-2"
        );

        store.delete_session("alice", "bob", 1).await.unwrap();
        assert!(!store.has_session("alice", "bob", 1).await.unwrap());
        cleanup(&path);
    }

    #[tokio::test]
    async fn consumed_prekey_private_is_gone_but_row_remains() {
        let (store, path) = open_temp().await;
        store.save_one_time_prekeys(&[otpk("bob", 0)]).await.unwrap();

        let claimed = store.claim_one_time_prekey("bob").await.unwrap().unwrap();
        assert_eq!(claimed.key_id, 0);
        assert!(claimed.sealed_private_key.is_some());

        store.consume_one_time_prekey("bob", 0).await.unwrap();
        let row = store.load_one_time_prekey("bob", 0).await.unwrap().unwrap();
        assert!(row.used);
        assert!(row.sealed_private_key.is_none());
        cleanup(&path);
    }

    #[tokio::test]
    async fn initial_keys_land_atomically() {
        let (store, path) = open_temp().await;
        let otpks: Vec<_> = (0..5).map(|i| otpk("alice", i)).collect();
        store
            .save_initial_keys(&identity("alice"), &spk("alice", 1, true), &otpks)
            .await
            .unwrap();
        assert!(store.load_active_identity("alice", 1).await.unwrap().is_some());
        assert_eq!(store.count_available_one_time_prekeys("alice").await.unwrap(), 5);

        // A second generation without cleanup collides on the identity row
        // and must leave the existing material untouched.
        assert!(store
            .save_initial_keys(&identity("alice"), &spk("alice", 2, true), &[])
            .await
            .is_err());
        assert_eq!(store.count_available_one_time_prekeys("alice").await.unwrap(), 5);
        cleanup(&path);
    }
}
