//! Profile resolution and name registration.
//!
//! Resolution is cache-first with a DHT fallback. Records that verify
//! under their own embedded key refresh the cache (monotone by
//! version); records that fail verification never refresh display
//! metadata, but a pinned KEM key from a first resolution keeps
//! working (trust-on-first-use).

use std::time::Duration;

use dna_crypto::kem::KemPublicKey;
use dna_crypto::sign::SignPublicKey;
use dna_proto::identity::{valid_name, Profile};
use dna_proto::Fingerprint;
use dna_spillway::dht::DhtWriter;
use dna_spillway::keys::{name_lookup_key, profile_key, writer_value_id};

use crate::engine::Engine;
use crate::error::EngineError;

/// "Permanent" records: refreshed by owners, never aged out by us.
pub const PERMANENT_TTL: Duration = Duration::from_secs(10 * 365 * 86_400);

impl Engine {
    /// Resolve a profile by hex fingerprint, cache-first.
    pub async fn lookup_profile(&self, fp_hex: &str) -> Result<Profile, EngineError> {
        let fp = Fingerprint::from_hex(fp_hex)
            .map_err(|_| EngineError::InvalidArg("malformed fingerprint".into()))?;

        if let Some(row) = self.store.get_profile(fp_hex).await? {
            if let Ok(profile) = serde_json::from_str::<Profile>(&row.record_json) {
                return Ok(profile);
            }
        }
        self.fetch_profile(&fp).await
    }

    /// Fetch from the DHT and update the cache.
    pub(crate) async fn fetch_profile(&self, fp: &Fingerprint) -> Result<Profile, EngineError> {
        let records = self.dht_get(&profile_key(fp)).await?;
        let mut best: Option<(Profile, bool)> = None;
        for record in records {
            let Ok(profile) = serde_json::from_slice::<Profile>(&record.value) else {
                continue;
            };
            if profile.fingerprint != fp.to_hex() {
                continue;
            }
            let verified = profile.verify_record();
            let better = match &best {
                None => true,
                Some((current, current_verified)) => {
                    (verified && !current_verified)
                        || (verified == *current_verified && profile.version > current.version)
                }
            };
            if better {
                best = Some((profile, verified));
            }
        }
        let (profile, verified) =
            best.ok_or_else(|| EngineError::NotFound(format!("profile {}", fp.short())))?;

        let now = crate::engine::unix_now();
        self.store
            .cache_profile(
                &profile.fingerprint,
                &serde_json::to_string(&profile).map_err(|e| EngineError::Internal(e.to_string()))?,
                profile.name.as_deref(),
                profile.version as i64,
                verified,
                now as i64,
            )
            .await?;
        if !verified {
            tracing::warn!(fp = %fp.short(), "profile failed verification, metadata not refreshed");
        }
        Ok(profile)
    }

    /// The recipient's KEM key, required for sending.
    pub(crate) async fn resolve_kem_key(&self, fp: &Fingerprint) -> Result<KemPublicKey, EngineError> {
        match self.lookup_profile(&fp.to_hex()).await {
            Ok(profile) => Ok(profile.kem_public()?),
            Err(EngineError::NotFound(_)) | Err(EngineError::Timeout) | Err(EngineError::Network(_)) => {
                Err(EngineError::KeyUnavailable(fp.short()))
            }
            Err(e) => Err(e),
        }
    }

    /// The sender's signing key, or None when resolution fails
    /// (signature verification is then deferred).
    pub(crate) async fn resolve_sign_key(&self, fp: &Fingerprint) -> Option<SignPublicKey> {
        match self.lookup_profile(&fp.to_hex()).await {
            Ok(profile) => profile.sign_public().ok(),
            Err(_) => None,
        }
    }

    /// Resolve a recipient given either a hex fingerprint or a
    /// registered name.
    pub(crate) async fn resolve_recipient(&self, who: &str) -> Result<Fingerprint, EngineError> {
        if let Ok(fp) = Fingerprint::from_hex(who) {
            return Ok(fp);
        }
        if !valid_name(who) {
            return Err(EngineError::InvalidArg(
                "recipient is neither a fingerprint nor a valid name".into(),
            ));
        }
        if let Some(row) = self.store.find_profile_by_name(who).await? {
            return Fingerprint::from_hex(&row.fingerprint)
                .map_err(|_| EngineError::Internal("cached fingerprint corrupt".into()));
        }
        // Name lookup mirror on the DHT.
        let records = self.dht_get(&name_lookup_key(who)).await?;
        for record in records {
            let Ok(profile) = serde_json::from_slice::<Profile>(&record.value) else {
                continue;
            };
            if profile.name.as_deref() == Some(who) && profile.verify_record() {
                let fp = profile.fingerprint()?;
                // Seed the cache through the normal path.
                let _ = self.fetch_profile(&fp).await;
                return Ok(fp);
            }
        }
        Err(EngineError::NotFound(format!("name {who}")))
    }

    /// Human-readable name for a fingerprint, falling back to the
    /// shortened hex form.
    pub async fn get_display_name(&self, fp_hex: &str) -> String {
        if let Ok(Some(row)) = self.store.get_profile(fp_hex).await {
            if let Some(name) = row.display_name {
                return name;
            }
        }
        fp_hex.chars().take(8).collect()
    }

    /// Register a globally unique name and publish the profile under
    /// both the profile key and the name-lookup mirror.
    pub async fn register_name(&self, name: &str) -> Result<(), EngineError> {
        if !valid_name(name) {
            return Err(EngineError::InvalidArg(
                "names are 3-20 chars of lowercase alphanumeric or underscore".into(),
            ));
        }

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };

        // Uniqueness: the lookup key must be vacant or already ours.
        let records = match self.dht_get(&name_lookup_key(name)).await {
            Ok(records) => records,
            Err(EngineError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let taken = records
            .into_iter()
            .filter_map(|r| serde_json::from_slice::<Profile>(&r.value).ok())
            .any(|p| p.verify_record() && p.fingerprint != session.fingerprint.to_hex());
        if taken {
            return Err(EngineError::InvalidArg(format!("name {name} is taken")));
        }

        let version = crate::engine::unix_now();
        let mut profile = Profile::new(
            version,
            &session.sign_public,
            &session.kem_public,
            Some(name.to_string()),
        );
        profile.sign_record(&session.sign_secret)?;
        let value =
            serde_json::to_vec(&profile).map_err(|e| EngineError::Internal(e.to_string()))?;

        let value_id = writer_value_id(&session.fingerprint);
        let writer = DhtWriter { secret: &session.sign_secret, public: &session.sign_public };
        self.dht_put(&profile_key(&session.fingerprint), value.clone(), value_id, PERMANENT_TTL, writer)
            .await?;
        self.dht_put(&name_lookup_key(name), value, value_id, PERMANENT_TTL, writer)
            .await?;
        drop(guard);

        // Session + on-disk public record pick up the name.
        {
            let mut guard = self.session.write().await;
            if let Some(session) = guard.as_mut() {
                session.name = Some(name.to_string());
            }
        }
        self.key_files().set_name(name)?;
        self.store
            .cache_profile(
                &profile.fingerprint,
                &serde_json::to_string(&profile).map_err(|e| EngineError::Internal(e.to_string()))?,
                Some(name),
                version as i64,
                true,
                version as i64,
            )
            .await?;
        Ok(())
    }
}
