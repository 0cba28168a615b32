//! Message persistence: insertion, dedup, status transitions, and
//! conversation queries.

use uuid::Uuid;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{Direction, MessageRow, MessageStatus};

/// Retry cap after which a FAILED message needs manual action.
pub const MAX_RETRY_COUNT: i64 = 10;

/// Inputs for a locally originated message.
pub struct NewOutgoing<'a> {
    /// Our hex fingerprint.
    pub sender: &'a str,
    /// Peer hex fingerprint or group uuid.
    pub recipient: &'a str,
    pub plaintext: &'a [u8],
    pub timestamp: i64,
    pub group_uuid: Option<&'a str>,
    pub ciphertext_hash: &'a str,
}

/// Inputs for a message received from the transport.
pub struct NewIncoming<'a> {
    pub sender: &'a str,
    pub recipient: &'a str,
    pub plaintext: &'a [u8],
    pub timestamp: i64,
    pub group_uuid: Option<&'a str>,
    pub offline_seq: i64,
    pub ciphertext_hash: &'a str,
    pub arrived_offline: bool,
    /// False when signature verification is deferred.
    pub verified: bool,
    /// Base64 detached signature; required when `verified` is false so
    /// the deferred check can run later.
    pub signature_b64: Option<String>,
}

impl Store {
    /// Allocate the next offline_seq for a `(us, peer)` pair.
    pub async fn allocate_offline_seq(&self, peer: &str) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO sync_state (peer, next_offline_seq) VALUES (?, 0)")
            .bind(peer)
            .execute(&mut *tx)
            .await?;
        let current: i64 =
            sqlx::query_scalar("SELECT next_offline_seq FROM sync_state WHERE peer = ?")
                .bind(peer)
                .fetch_one(&mut *tx)
                .await?;
        let next = current + 1;
        sqlx::query("UPDATE sync_state SET next_offline_seq = ? WHERE peer = ?")
            .bind(next)
            .bind(peer)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Persist an outgoing message as PENDING with a fresh offline_seq.
    /// Returns (message id, offline_seq).
    pub async fn insert_outgoing(&self, msg: NewOutgoing<'_>) -> Result<(String, i64), StoreError> {
        let id = Uuid::new_v4().to_string();
        let offline_seq = self.allocate_offline_seq(msg.recipient).await?;
        let body_enc = self.encrypt_value(msg.plaintext).await?;
        let message_type = if msg.group_uuid.is_some() { "group" } else { "direct" };

        sqlx::query(
            "INSERT INTO messages \
             (id, sender, recipient, body_enc, timestamp, direction, status, retry_count, \
              group_uuid, message_type, offline_seq, sender_fingerprint, ciphertext_hash, \
              arrived_offline, verified) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, 0, 1)",
        )
        .bind(&id)
        .bind(msg.sender)
        .bind(msg.recipient)
        .bind(&body_enc)
        .bind(msg.timestamp)
        .bind(Direction::Outgoing.as_str())
        .bind(MessageStatus::Pending.as_str())
        .bind(msg.group_uuid)
        .bind(message_type)
        .bind(offline_seq)
        .bind(msg.sender)
        .bind(msg.ciphertext_hash)
        .execute(&self.pool)
        .await?;
        Ok((id, offline_seq))
    }

    /// Persist an incoming message, deduplicating by
    /// `(sender_fingerprint, recipient, offline_seq)` and by ciphertext
    /// hash. Returns the new row id, or None for a duplicate.
    pub async fn insert_incoming(&self, msg: NewIncoming<'_>) -> Result<Option<String>, StoreError> {
        let body_enc = self.encrypt_value(msg.plaintext).await?;
        let id = Uuid::new_v4().to_string();
        let message_type = if msg.group_uuid.is_some() { "group" } else { "direct" };

        let mut tx = self.pool.begin().await?;
        let hash_dup: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE ciphertext_hash = ?")
                .bind(msg.ciphertext_hash)
                .fetch_one(&mut *tx)
                .await?;
        if hash_dup > 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            "INSERT INTO messages \
             (id, sender, recipient, body_enc, timestamp, direction, status, retry_count, \
              group_uuid, message_type, offline_seq, sender_fingerprint, ciphertext_hash, \
              arrived_offline, verified, signature_b64) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (sender_fingerprint, recipient, offline_seq) DO NOTHING",
        )
        .bind(&id)
        .bind(msg.sender)
        .bind(msg.recipient)
        .bind(&body_enc)
        .bind(msg.timestamp)
        .bind(Direction::Incoming.as_str())
        .bind(MessageStatus::Received.as_str())
        .bind(msg.group_uuid)
        .bind(message_type)
        .bind(msg.offline_seq)
        .bind(msg.sender)
        .bind(msg.ciphertext_hash)
        .bind(msg.arrived_offline)
        .bind(msg.verified)
        .bind(&msg.signature_b64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok((result.rows_affected() > 0).then_some(id))
    }

    pub async fn get_message(&self, id: &str) -> Result<MessageRow, StoreError> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    pub async fn set_status(&self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// FAILED + retry_count bump in one statement.
    pub async fn mark_failed(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages SET status = 'FAILED', retry_count = retry_count + 1 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// FAILED with the retry counter exhausted (non-retryable
    /// failures: the sweep must not pick these up again).
    pub async fn mark_failed_terminal(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET status = 'FAILED', retry_count = ? WHERE id = ?")
            .bind(MAX_RETRY_COUNT)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The hash becomes known once the envelope is sealed.
    pub async fn set_ciphertext_hash(&self, id: &str, hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET ciphertext_hash = ? WHERE id = ?")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Outgoing messages never transmitted (e.g. recipient key
    /// unresolvable at send time).
    pub async fn stuck_pending(&self) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages \
             WHERE status = 'PENDING' AND direction = 'outgoing' \
             ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Deferred signature verification resolved: the stored signature
    /// has served its purpose.
    pub async fn mark_verified(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET verified = 1, signature_b64 = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Messages whose sender signature is still unverified.
    pub async fn unverified_messages(&self) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE verified = 0 AND signature_b64 IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Remove a message outright (deferred verification resolved to a
    /// forgery: the plaintext must not survive).
    pub async fn delete_message(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// ACK applied: flip SENT → RECEIVED for everything at or before
    /// the peer's sync timestamp. Returns the flipped row ids.
    pub async fn mark_received_up_to(
        &self,
        peer: &str,
        synced_at: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM messages \
             WHERE direction = 'outgoing' AND recipient = ? AND status = 'SENT' \
               AND timestamp <= ?",
        )
        .bind(peer)
        .bind(synced_at)
        .fetch_all(&mut *tx)
        .await?;
        if !ids.is_empty() {
            sqlx::query(
                "UPDATE messages SET status = 'RECEIVED' \
                 WHERE direction = 'outgoing' AND recipient = ? AND status = 'SENT' \
                   AND timestamp <= ?",
            )
            .bind(peer)
            .bind(synced_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Both directions of one direct conversation, in the receiver's
    /// total order (timestamp, then offline_seq).
    pub async fn conversation(&self, me: &str, peer: &str) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages \
             WHERE message_type = 'direct' \
               AND ((sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?)) \
             ORDER BY timestamp ASC, offline_seq ASC",
        )
        .bind(me)
        .bind(peer)
        .bind(peer)
        .bind(me)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn group_messages(&self, group_uuid: &str) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE group_uuid = ? \
             ORDER BY timestamp ASC, offline_seq ASC",
        )
        .bind(group_uuid)
        .fetch_all(&self.pool)
        .await?)
    }

    /// FAILED messages still under the retry cap, oldest first.
    pub async fn failed_retryable(&self) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages \
             WHERE status = 'FAILED' AND retry_count < ? AND direction = 'outgoing' \
             ORDER BY timestamp ASC",
        )
        .bind(MAX_RETRY_COUNT)
        .fetch_all(&self.pool)
        .await?)
    }

    // ── Per-peer sync bookkeeping ──────────────────────────────────────────

    /// Make a peer part of the sync roster without touching its state.
    pub async fn ensure_peer(&self, peer: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO sync_state (peer, next_offline_seq) VALUES (?, 0)")
            .bind(peer)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_sync(&self, peer: &str) -> Result<Option<i64>, StoreError> {
        Ok(sqlx::query_scalar("SELECT last_sync FROM sync_state WHERE peer = ?")
            .bind(peer)
            .fetch_optional(&self.pool)
            .await?
            .flatten())
    }

    pub async fn set_last_sync(&self, peer: &str, at: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (peer, last_sync, next_offline_seq) VALUES (?, ?, 0) \
             ON CONFLICT (peer) DO UPDATE SET last_sync = excluded.last_sync",
        )
        .bind(peer)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ack_published(&self, peer: &str, at: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (peer, last_ack_published, next_offline_seq) VALUES (?, ?, 0) \
             ON CONFLICT (peer) DO UPDATE SET last_ack_published = excluded.last_ack_published",
        )
        .bind(peer)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Contacts we have ever exchanged direct messages or sync state
    /// with (the listen/poll roster).
    pub async fn known_peers(&self, me: &str) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT peer FROM ( \
                 SELECT peer FROM sync_state WHERE length(peer) = 128 \
                 UNION SELECT sender AS peer FROM messages \
                     WHERE message_type = 'direct' AND sender != ? \
                 UNION SELECT recipient AS peer FROM messages \
                     WHERE message_type = 'direct' AND recipient != ? \
             )",
        )
        .bind(me)
        .bind(me)
        .fetch_all(&self.pool)
        .await?)
    }
}
