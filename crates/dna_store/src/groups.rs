//! Group, membership, and GEK persistence.
//!
//! GEK rows hold key material wrapped under the owner's own KEM key;
//! unwrapping happens in the engine where the KEM secret lives. Old
//! versions are retained for a grace window past expiry so
//! late-arriving messages still decrypt.

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{GekRow, GroupMemberRow, GroupRow};

/// How long an expired GEK version stays decryptable.
pub const GEK_RETENTION_PAST_EXPIRY: i64 = 7 * 86_400;

impl Store {
    pub async fn insert_group(
        &self,
        uuid: &str,
        name: &str,
        owner: &str,
        created_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO groups (uuid, name, owner_fingerprint, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(name)
        .bind(owner)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_group(&self, uuid: &str) -> Result<GroupRow, StoreError> {
        sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("group {uuid}")))
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupRow>, StoreError> {
        Ok(sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE tombstoned = 0")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn tombstone_group(&self, uuid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE groups SET tombstoned = 1 WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_member(
        &self,
        group_uuid: &str,
        fingerprint: &str,
        added_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_uuid, fingerprint, added_at) \
             VALUES (?, ?, ?)",
        )
        .bind(group_uuid)
        .bind(fingerprint)
        .bind(added_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, group_uuid: &str, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM group_members WHERE group_uuid = ? AND fingerprint = ?")
            .bind(group_uuid)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn group_members(&self, group_uuid: &str) -> Result<Vec<GroupMemberRow>, StoreError> {
        Ok(sqlx::query_as::<_, GroupMemberRow>(
            "SELECT * FROM group_members WHERE group_uuid = ? ORDER BY added_at ASC",
        )
        .bind(group_uuid)
        .fetch_all(&self.pool)
        .await?)
    }

    // ── GEK versions ────────────────────────────────────────────────────────

    /// Insert one GEK version. Versions are monotone per group; an
    /// attempt to re-insert or regress is a constraint violation the
    /// caller resolves by bumping (same-second rotation).
    pub async fn insert_gek(
        &self,
        group_uuid: &str,
        version: i64,
        wrapped_key: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let newest = self.latest_gek_version(group_uuid).await?;
        if let Some(newest) = newest {
            if version <= newest {
                return Err(StoreError::Conflict(format!(
                    "gek version {version} not newer than {newest}"
                )));
            }
        }
        sqlx::query(
            "INSERT INTO geks (group_uuid, version, wrapped_key, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(group_uuid)
        .bind(version)
        .bind(wrapped_key)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A GEK received via IKP: no monotonicity demand (late-arriving
    /// older versions are kept to decrypt old traffic).
    pub async fn insert_gek_version_unchecked(
        &self,
        group_uuid: &str,
        version: i64,
        wrapped_key: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO geks (group_uuid, version, wrapped_key, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(group_uuid)
        .bind(version)
        .bind(wrapped_key)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_gek(&self, group_uuid: &str, version: i64) -> Result<GekRow, StoreError> {
        sqlx::query_as::<_, GekRow>("SELECT * FROM geks WHERE group_uuid = ? AND version = ?")
            .bind(group_uuid)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("gek {group_uuid} v{version}")))
    }

    pub async fn latest_gek(&self, group_uuid: &str) -> Result<Option<GekRow>, StoreError> {
        Ok(sqlx::query_as::<_, GekRow>(
            "SELECT * FROM geks WHERE group_uuid = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(group_uuid)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn latest_gek_version(&self, group_uuid: &str) -> Result<Option<i64>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT MAX(version) FROM geks WHERE group_uuid = ?",
        )
        .bind(group_uuid)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Drop GEK versions past expiry plus the retention grace window.
    pub async fn prune_geks(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM geks WHERE expires_at + ? < ?")
            .bind(GEK_RETENTION_PAST_EXPIRY)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
