//! Keyserver cache: the latest accepted profile per fingerprint.
//!
//! Trust-on-first-use: a cached verified record is only replaced by a
//! verified record with a strictly higher version. Unverified records
//! never refresh display metadata.

use crate::db::Store;
use crate::error::StoreError;
use crate::models::ProfileRow;

impl Store {
    /// Upsert a profile if it improves on the cached one (higher
    /// version, verified). Returns true when the cache changed.
    pub async fn cache_profile(
        &self,
        fingerprint: &str,
        record_json: &str,
        display_name: Option<&str>,
        version: i64,
        verified: bool,
        fetched_at: i64,
    ) -> Result<bool, StoreError> {
        if !verified {
            // Unverified records never overwrite; they are only useful
            // when we have nothing at all (pinned-key bootstrap).
            let existing = self.get_profile(fingerprint).await?;
            if existing.is_some() {
                return Ok(false);
            }
        }

        let mut tx = self.pool.begin().await?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM profiles WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(current) = current {
            if version <= current {
                tx.rollback().await?;
                return Ok(false);
            }
        }
        sqlx::query(
            "INSERT INTO profiles (fingerprint, record_json, display_name, version, verified, fetched_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (fingerprint) DO UPDATE SET \
                 record_json = excluded.record_json, \
                 display_name = excluded.display_name, \
                 version = excluded.version, \
                 verified = excluded.verified, \
                 fetched_at = excluded.fetched_at",
        )
        .bind(fingerprint)
        .bind(record_json)
        .bind(display_name)
        .bind(version)
        .bind(verified)
        .bind(fetched_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_profile(&self, fingerprint: &str) -> Result<Option<ProfileRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn find_profile_by_name(&self, name: &str) -> Result<Option<ProfileRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles WHERE display_name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}
