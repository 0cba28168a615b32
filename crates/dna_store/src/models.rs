//! Database row models.

use serde::{Deserialize, Serialize};

/// The four user-visible delivery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sent,
    Received,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Received => "RECEIVED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "RECEIVED" => Some(Self::Received),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    /// Hex sender fingerprint.
    pub sender: String,
    /// Hex recipient fingerprint, or group uuid for group messages.
    pub recipient: String,
    /// Store-encrypted plaintext, base64.
    pub body_enc: String,
    /// Envelope timestamp (sender clock), not arrival time.
    pub timestamp: i64,
    pub direction: String,
    pub status: String,
    pub retry_count: i64,
    pub group_uuid: Option<String>,
    pub message_type: String,
    pub offline_seq: i64,
    pub sender_fingerprint: String,
    /// SHA3-256 of the envelope bytes, hex (dedup cross-check).
    pub ciphertext_hash: String,
    pub arrived_offline: bool,
    /// False while the sender signature is deferred (key unresolved).
    pub verified: bool,
    /// Detached signature, present only while verification is deferred.
    pub signature_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupRow {
    pub uuid: String,
    pub name: String,
    pub owner_fingerprint: String,
    pub created_at: i64,
    pub tombstoned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMemberRow {
    pub group_uuid: String,
    pub fingerprint: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GekRow {
    pub group_uuid: String,
    pub version: i64,
    /// base64(kem_ct ‖ RFC 3394 blob), wrapped under the owner's KEM key.
    pub wrapped_key: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileRow {
    pub fingerprint: String,
    pub record_json: String,
    pub display_name: Option<String>,
    pub version: i64,
    pub verified: bool,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncStateRow {
    pub peer: String,
    pub last_sync: Option<i64>,
    pub last_ack_published: Option<i64>,
    pub next_offline_seq: i64,
}
