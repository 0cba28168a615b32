//! Group Encryption Key lifecycle and group messaging.
//!
//! The owner generates a fresh GEK on creation, on every membership
//! change, and daily; each version ships to members as a signed
//! Initial Key Packet published via the chunked transport. Members
//! cache every version they ever held so late-arriving messages under
//! old versions still decrypt until retention drops them.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use dna_crypto::hash::{sha3_256, sha3_512};
use dna_crypto::kem::{kem_decap, kem_encap, KEM_CIPHERTEXT_LEN};
use dna_crypto::keywrap::{key_unwrap, key_wrap, WRAPPED_KEY_LEN};
use dna_crypto::rng::csprng_array;
use dna_proto::envelope;
use dna_proto::ikp::{self, Ikp, IkpMember, MAX_MEMBERS};
use dna_proto::Fingerprint;
use dna_spillway::chunked::Fetched;
use dna_spillway::dht::{DhtKey, DhtWriter};
use dna_spillway::keys::{day_of, group_outbox_base, ikp_base, writer_value_id};
use dna_spillway::outbox::{self, OutboxEntry};
use dna_spillway::TransportError;
use dna_store::messages::{NewIncoming, NewOutgoing};
use dna_store::models::MessageStatus;

use crate::engine::{unix_now, Engine};
use crate::error::EngineError;
use crate::events::{Event, MessageView};
use crate::identity::Session;

pub const GEK_LIFETIME: u64 = 7 * 86_400;
pub const GEK_ROTATION_AGE: u64 = 86_400;
pub const IKP_TTL: Duration = Duration::from_secs(30 * 86_400);
const META_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Owner-published group descriptor (discovery + current GEK version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GroupMeta {
    pub uuid: String,
    pub name: String,
    /// Owner fingerprint, hex.
    pub owner: String,
    /// Current GEK version.
    pub version: u32,
    /// Member fingerprints, hex.
    pub members: Vec<String>,
}

fn meta_key(uuid: &str) -> DhtKey {
    DhtKey::from_bytes(&sha3_512(format!("dna:group:{uuid}:meta").as_bytes()))
}

/// Wrap a GEK at rest under our own KEM key: encapsulate to self,
/// RFC 3394 wrap under the shared secret.
fn wrap_gek_at_rest(session: &Session, gek: &[u8; 32]) -> Result<String, EngineError> {
    let (kem_ct, ss) = kem_encap(&session.kem_public)?;
    let wrapped = key_wrap(ss.as_bytes(), gek)?;
    let mut blob = Vec::with_capacity(KEM_CIPHERTEXT_LEN + WRAPPED_KEY_LEN);
    blob.extend_from_slice(&kem_ct);
    blob.extend_from_slice(&wrapped);
    Ok(B64.encode(blob))
}

fn unwrap_gek_at_rest(session: &Session, blob_b64: &str) -> Result<Zeroizing<[u8; 32]>, EngineError> {
    let blob = B64
        .decode(blob_b64)
        .map_err(|_| EngineError::Internal("gek blob corrupt".into()))?;
    if blob.len() != KEM_CIPHERTEXT_LEN + WRAPPED_KEY_LEN {
        return Err(EngineError::Internal("gek blob corrupt".into()));
    }
    let ss = kem_decap(&session.kem_secret, &blob[..KEM_CIPHERTEXT_LEN])?;
    let wrapped: &[u8; WRAPPED_KEY_LEN] = blob[KEM_CIPHERTEXT_LEN..].try_into().unwrap();
    let gek = key_unwrap(ss.as_bytes(), wrapped)?;
    Ok(Zeroizing::new(*gek))
}

impl Engine {
    /// Create a group with ourselves as owner. Members receive the
    /// first GEK via the published IKP.
    pub async fn create_group(
        &self,
        name: &str,
        members: &[String],
    ) -> Result<String, EngineError> {
        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };

        let mut roster: Vec<Fingerprint> = vec![me];
        for member in members {
            let fp = Fingerprint::from_hex(member)
                .map_err(|_| EngineError::InvalidArg("malformed member fingerprint".into()))?;
            if !roster.contains(&fp) {
                roster.push(fp);
            }
        }
        if roster.len() > MAX_MEMBERS {
            return Err(EngineError::InvalidArg(format!(
                "groups are limited to {MAX_MEMBERS} members"
            )));
        }

        let uuid = Uuid::new_v4().to_string();
        let now = unix_now() as i64;
        self.store.insert_group(&uuid, name, &me.to_hex(), now).await?;
        for fp in &roster {
            self.store.add_member(&uuid, &fp.to_hex(), now).await?;
        }

        self.rotate_gek(&uuid).await?;
        Ok(uuid)
    }

    /// Add a member: membership change forces rotation, and the new
    /// member's first readable version is the new one.
    pub async fn add_group_member(&self, uuid: &str, member: &str) -> Result<(), EngineError> {
        self.require_ownership(uuid).await?;
        let fp = Fingerprint::from_hex(member)
            .map_err(|_| EngineError::InvalidArg("malformed member fingerprint".into()))?;
        let members = self.store.group_members(uuid).await?;
        if members.iter().any(|m| m.fingerprint == fp.to_hex()) {
            return Err(EngineError::InvalidArg("already a member".into()));
        }
        if members.len() + 1 > MAX_MEMBERS {
            return Err(EngineError::InvalidArg(format!(
                "groups are limited to {MAX_MEMBERS} members"
            )));
        }
        // The member must be resolvable before they can hold a key.
        self.resolve_kem_key(&fp).await?;
        self.store.add_member(uuid, &fp.to_hex(), unix_now() as i64).await?;
        self.rotate_gek(uuid).await
    }

    /// Remove a member. The rotated GEK's IKP excludes them, so
    /// nothing written after this point is readable with their cache.
    pub async fn remove_group_member(&self, uuid: &str, member: &str) -> Result<(), EngineError> {
        self.require_ownership(uuid).await?;
        let fp = Fingerprint::from_hex(member)
            .map_err(|_| EngineError::InvalidArg("malformed member fingerprint".into()))?;
        let owner = self.store.get_group(uuid).await?.owner_fingerprint;
        if fp.to_hex() == owner {
            return Err(EngineError::InvalidArg("owner cannot be removed".into()));
        }
        self.store.remove_member(uuid, &fp.to_hex()).await?;
        self.rotate_gek(uuid).await
    }

    pub async fn delete_group(&self, uuid: &str) -> Result<(), EngineError> {
        self.require_ownership(uuid).await?;
        self.store.tombstone_group(uuid).await?;
        Ok(())
    }

    async fn require_ownership(&self, uuid: &str) -> Result<(), EngineError> {
        let group = self.store.get_group(uuid).await?;
        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };
        if group.owner_fingerprint != session.fingerprint.to_hex() {
            return Err(EngineError::InvalidArg("only the group owner may do this".into()));
        }
        if group.tombstoned {
            return Err(EngineError::InvalidArg("group is deleted".into()));
        }
        Ok(())
    }

    /// Generate and publish a new GEK version (owner only).
    pub(crate) async fn rotate_gek(&self, uuid: &str) -> Result<(), EngineError> {
        let group = self.store.get_group(uuid).await?;
        let member_rows = self.store.group_members(uuid).await?;
        let now = unix_now();

        // Same-second rotations bump by one to keep versions monotone.
        let latest = self.store.latest_gek_version(uuid).await?;
        let version = match latest {
            Some(latest) => (now as i64).max(latest + 1) as u64,
            None => now,
        };
        let version_u32: u32 = version
            .try_into()
            .map_err(|_| EngineError::Internal("gek version overflow".into()))?;

        let gek = Zeroizing::new(csprng_array::<32>()?);

        // Resolve every member's KEM key up front; an unresolvable
        // member fails the rotation rather than silently excluding.
        let mut ikp_members = Vec::with_capacity(member_rows.len());
        for row in &member_rows {
            let fp = Fingerprint::from_hex(&row.fingerprint)
                .map_err(|_| EngineError::Internal("stored member fingerprint corrupt".into()))?;
            let kem_public = self.resolve_member_kem(&fp).await?;
            ikp_members.push(IkpMember { fingerprint: fp, kem_public });
        }

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };

        let wrapped = wrap_gek_at_rest(session, &gek)?;
        self.store
            .insert_gek(uuid, version as i64, &wrapped, now as i64, (now + GEK_LIFETIME) as i64)
            .await?;

        let packet = ikp::build(
            &session.sign_secret,
            &session.fingerprint,
            uuid,
            version_u32,
            &gek,
            &ikp_members,
        )?;
        self.chunked
            .publish(
                &ikp_base(uuid, version_u32),
                &packet,
                writer_value_id(&session.fingerprint),
                IKP_TTL,
                &session.sign_secret,
                &session.sign_public,
            )
            .await?;

        let meta = GroupMeta {
            uuid: uuid.to_string(),
            name: group.name,
            owner: group.owner_fingerprint,
            version: version_u32,
            members: member_rows.iter().map(|m| m.fingerprint.clone()).collect(),
        };
        let value =
            serde_json::to_vec(&meta).map_err(|e| EngineError::Internal(e.to_string()))?;
        let writer = DhtWriter { secret: &session.sign_secret, public: &session.sign_public };
        self.dht_put(
            &meta_key(uuid),
            value,
            writer_value_id(&session.fingerprint),
            META_TTL,
            writer,
        )
        .await?;

        tracing::info!(group = uuid, version = version_u32, "gek rotated");
        Ok(())
    }

    /// The member's KEM key: our own comes from the session, others
    /// from the keyserver.
    async fn resolve_member_kem(
        &self,
        fp: &Fingerprint,
    ) -> Result<dna_crypto::kem::KemPublicKey, EngineError> {
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if &session.fingerprint == fp {
                    return Ok(session.kem_public.clone());
                }
            }
        }
        self.resolve_kem_key(fp).await
    }

    /// Send a group message under the active GEK.
    pub async fn send_group_message(&self, uuid: &str, plaintext: &str) -> Result<String, EngineError> {
        let group = self.store.get_group(uuid).await?;
        if group.tombstoned {
            return Err(EngineError::InvalidArg("group is deleted".into()));
        }
        let now = unix_now();

        let gek_row = self
            .store
            .latest_gek(uuid)
            .await?
            .ok_or_else(|| EngineError::KeyUnavailable(format!("group {uuid}")))?;
        if (gek_row.expires_at as u64) < now {
            // The owner refreshes in place; members must re-sync.
            let me = {
                let guard = self.session.read().await;
                guard.as_ref().map(|s| s.fingerprint.to_hex())
            };
            if me.as_deref() == Some(group.owner_fingerprint.as_str()) {
                self.rotate_gek(uuid).await?;
            } else {
                return Err(EngineError::KeyUnavailable(format!("group {uuid} key expired")));
            }
        }
        let gek_row = self
            .store
            .latest_gek(uuid)
            .await?
            .ok_or_else(|| EngineError::KeyUnavailable(format!("group {uuid}")))?;

        let (id, offline_seq, sealed, me_hex) = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            let gek = unwrap_gek_at_rest(session, &gek_row.wrapped_key)?;
            let version_u32: u32 = (gek_row.version as u64)
                .try_into()
                .map_err(|_| EngineError::Internal("gek version overflow".into()))?;
            let sealed = envelope::seal_group(
                &session.sign_secret,
                &session.sign_public,
                &gek,
                uuid,
                version_u32,
                plaintext.as_bytes(),
                now,
            )?;
            let me_hex = session.fingerprint.to_hex();
            let (id, offline_seq) = self
                .store
                .insert_outgoing(NewOutgoing {
                    sender: &me_hex,
                    recipient: uuid,
                    plaintext: plaintext.as_bytes(),
                    timestamp: now as i64,
                    group_uuid: Some(uuid),
                    ciphertext_hash: "",
                })
                .await?;
            (id, offline_seq, sealed, me_hex)
        };

        let hash = hex::encode(sha3_256(&sealed));
        self.store.set_ciphertext_hash(&id, &hash).await?;

        let entry =
            OutboxEntry::new(offline_seq as u64, now, me_hex.clone(), uuid.to_string(), &sealed);

        let bucket_lock = self.outbox_lock(uuid);
        let _held = bucket_lock.lock().await;
        let result = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            outbox::publish_to_base(
                &self.chunked,
                &group_outbox_base(uuid, day_of(now)),
                writer_value_id(&session.fingerprint),
                entry,
                &session.sign_secret,
                &session.sign_public,
            )
            .await
        };
        drop(_held);

        match result {
            Ok(()) => {
                self.store.set_status(&id, MessageStatus::Sent).await?;
                self.events.emit(Event::MessageStatusChanged {
                    id: id.clone(),
                    new_status: MessageStatus::Sent,
                });
                Ok(id)
            }
            Err(e) => {
                self.store.mark_failed(&id).await?;
                Err(e.into())
            }
        }
    }

    /// Force GEK recovery and fetch group traffic. Also how an invitee
    /// first materialises a group locally.
    pub async fn sync_group(&self, uuid: &str) -> Result<(), EngineError> {
        let meta = self.fetch_group_meta(uuid).await?;
        let now = unix_now();

        // Materialise or refresh the local group from the owner's meta.
        let known = self.store.get_group(uuid).await.is_ok();
        if !known {
            self.store
                .insert_group(uuid, &meta.name, &meta.owner, now as i64)
                .await?;
            let from = meta.owner.clone();
            self.events.emit(Event::GroupInvitationReceived {
                group_uuid: uuid.to_string(),
                group_name: meta.name.clone(),
                from,
            });
        }
        let current: Vec<String> = self
            .store
            .group_members(uuid)
            .await?
            .into_iter()
            .map(|m| m.fingerprint)
            .collect();
        for member in &meta.members {
            if !current.contains(member) {
                self.store.add_member(uuid, member, now as i64).await?;
            }
        }
        for member in &current {
            if !meta.members.contains(member) {
                self.store.remove_member(uuid, member).await?;
            }
        }

        // Recover the current GEK version if we lack it.
        if self.store.get_gek(uuid, meta.version as i64).await.is_err() {
            self.recover_gek(uuid, &meta).await?;
        }

        // Pull group traffic over the smart-sync window.
        let last = self.store.last_sync(uuid).await?.map(|t| t as u64);
        for day in dna_spillway::sync::sync_window(now, last) {
            let base = group_outbox_base(uuid, day);
            let buckets = match outbox::fetch_buckets(&self.chunked, &base).await {
                Ok(buckets) => buckets,
                Err(TransportError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            for (_writer, entries) in buckets {
                for entry in entries {
                    if entry.expiry < now {
                        continue;
                    }
                    if let Err(e) = self.process_incoming_group(uuid, &entry).await {
                        tracing::debug!(error = %e, "group entry skipped");
                    }
                }
            }
        }
        self.store.set_last_sync(uuid, now as i64).await?;
        Ok(())
    }

    async fn fetch_group_meta(&self, uuid: &str) -> Result<GroupMeta, EngineError> {
        let records = self.dht_get(&meta_key(uuid)).await?;
        let mut best: Option<GroupMeta> = None;
        for record in records {
            let Ok(meta) = serde_json::from_slice::<GroupMeta>(&record.value) else {
                continue;
            };
            if meta.uuid != uuid {
                continue;
            }
            // The writer must be the claimed owner.
            let Ok(writer) = dna_crypto::sign::SignPublicKey::from_bytes(&record.writer) else {
                continue;
            };
            if Fingerprint::from_sign_public(&writer).to_hex() != meta.owner {
                tracing::warn!(group = uuid, "group meta writer is not the owner");
                continue;
            }
            if best.as_ref().map_or(true, |b| meta.version > b.version) {
                best = Some(meta);
            }
        }
        best.ok_or_else(|| EngineError::NotFound(format!("group {uuid}")))
    }

    /// Fetch + verify + extract the IKP for `meta.version`.
    async fn recover_gek(&self, uuid: &str, meta: &GroupMeta) -> Result<(), EngineError> {
        let owner_fp = Fingerprint::from_hex(&meta.owner)
            .map_err(|_| EngineError::Internal("meta owner corrupt".into()))?;
        let owner_key = self
            .resolve_sign_key(&owner_fp)
            .await
            .ok_or_else(|| EngineError::KeyUnavailable(owner_fp.short()))?;

        let fetched = self
            .chunked
            .fetch_all(&ikp_base(uuid, meta.version))
            .await
            .map_err(EngineError::from)?;
        let packet = fetched
            .into_iter()
            .find_map(|f| match f {
                Fetched::Value { value, .. } => Some(value),
                Fetched::Unchanged { .. } => None,
            })
            .ok_or_else(|| EngineError::NotFound(format!("ikp for group {uuid}")))?;

        let parsed = Ikp::parse(&packet)?;
        if parsed.group_uuid != uuid || parsed.version != meta.version {
            return Err(EngineError::AuthFailed);
        }
        parsed.verify(&owner_key)?;

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };
        let gek = parsed.extract(&session.fingerprint, &session.kem_secret)?;
        let wrapped = wrap_gek_at_rest(session, &gek)?;
        let now = unix_now();
        self.store
            .insert_gek_version_unchecked(
                uuid,
                meta.version as i64,
                &wrapped,
                meta.version as i64,
                (meta.version as u64 + GEK_LIFETIME) as i64,
            )
            .await?;
        tracing::info!(group = uuid, version = meta.version, at = now, "gek recovered from ikp");
        Ok(())
    }

    async fn process_incoming_group(&self, uuid: &str, entry: &OutboxEntry) -> Result<(), EngineError> {
        let ciphertext = entry.ciphertext().map_err(EngineError::from)?;
        let hash = hex::encode(sha3_256(&ciphertext));

        let (env_uuid, version) = envelope::peek_group_info(&ciphertext)?;
        if env_uuid != uuid {
            return Err(EngineError::InvalidArg("envelope addressed to another group".into()));
        }
        let gek_row = self
            .store
            .get_gek(uuid, version as i64)
            .await
            .map_err(|_| EngineError::KeyUnavailable(format!("gek v{version}")))?;

        let opened = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            let gek = unwrap_gek_at_rest(session, &gek_row.wrapped_key)?;
            envelope::open_group(&gek, &ciphertext)?
        };
        let sender = opened.sender;

        // Skip our own bucket entries (we already hold the original).
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.fingerprint == sender {
                    return Ok(());
                }
            }
        }

        let verified = match self.resolve_sign_key(&sender).await {
            Some(key) => match opened.verify_sender(&key) {
                Ok(()) => true,
                Err(_) => return Err(EngineError::SignatureInvalid),
            },
            None => false,
        };

        let inserted = self
            .store
            .insert_incoming(NewIncoming {
                sender: &sender.to_hex(),
                recipient: uuid,
                plaintext: &opened.plaintext,
                timestamp: opened.timestamp as i64,
                group_uuid: Some(uuid),
                offline_seq: entry.offline_seq as i64,
                ciphertext_hash: &hash,
                arrived_offline: true,
                verified,
                signature_b64: (!verified).then(|| B64.encode(opened.signature())),
            })
            .await?;

        if let Some(id) = inserted {
            self.events.emit(Event::MessageReceived {
                message: MessageView {
                    id,
                    sender: sender.to_hex(),
                    recipient: uuid.to_string(),
                    plaintext: String::from_utf8_lossy(&opened.plaintext).into_owned(),
                    timestamp: opened.timestamp,
                    group_uuid: Some(uuid.to_string()),
                    verified,
                    status: MessageStatus::Received.as_str().to_string(),
                },
            });
        }
        Ok(())
    }

    /// Decrypted group history, oldest first.
    pub async fn get_group_messages(&self, uuid: &str) -> Result<Vec<MessageView>, EngineError> {
        let rows = self.store.group_messages(uuid).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.row_to_view(row).await?);
        }
        Ok(views)
    }

    /// Heartbeat hook: rotate every owned group whose newest GEK is
    /// older than 24 hours, and prune expired versions.
    pub(crate) async fn rotate_stale_geks(&self) {
        let me = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                Some(session) => session.fingerprint.to_hex(),
                None => return,
            }
        };
        let now = unix_now();
        let groups = match self.store.list_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!(error = %e, "group listing failed in heartbeat");
                return;
            }
        };
        for group in groups.iter().filter(|g| g.owner_fingerprint == me) {
            let stale = match self.store.latest_gek(&group.uuid).await {
                Ok(Some(row)) => now.saturating_sub(row.created_at as u64) > GEK_ROTATION_AGE,
                Ok(None) => true,
                Err(_) => false,
            };
            if stale {
                if let Err(e) = self.rotate_gek(&group.uuid).await {
                    tracing::warn!(group = %group.uuid, error = %e, "daily rotation failed");
                }
            }
        }
        if let Err(e) = self.store.prune_geks(now as i64).await {
            tracing::warn!(error = %e, "gek pruning failed");
        }
    }
}
