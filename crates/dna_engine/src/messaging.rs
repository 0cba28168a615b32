//! Direct messaging: send, offline sync, ACKs, retry sweep.
//!
//! Send path: persist PENDING → envelope-encrypt → append to today's
//! outbox bucket (per-contact mutex, replace-publish) → SENT, or
//! FAILED with a bumped retry counter. Receive path: listen pushes
//! and windowed polls feed the same decrypt-dedup-store pipeline.

use dna_crypto::hash::sha3_256;
use dna_proto::envelope;
use dna_proto::Fingerprint;
use dna_spillway::ack::{publish_ack, read_ack};
use dna_spillway::keys::{day_of, outbox_base};
use dna_spillway::outbox::{self, OutboxEntry};
use dna_spillway::TransportError;
use dna_store::messages::{NewIncoming, NewOutgoing};
use dna_store::models::{MessageRow, MessageStatus};

use crate::engine::{unix_now, Engine};
use crate::error::EngineError;
use crate::events::{Event, MessageView};

impl Engine {
    /// Send a direct message to a fingerprint or registered name.
    /// Returns the message id; delivery progress arrives as
    /// `MessageStatusChanged` events.
    pub async fn send_message(&self, recipient: &str, plaintext: &str) -> Result<String, EngineError> {
        if plaintext.len() > envelope::MAX_PLAINTEXT_LEN {
            return Err(EngineError::InvalidArg("plaintext exceeds 512 KiB".into()));
        }
        let peer = self.resolve_recipient(recipient).await?;
        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };
        if peer == me {
            return Err(EngineError::InvalidArg("cannot message yourself".into()));
        }

        let (id, _seq) = self
            .store
            .insert_outgoing(NewOutgoing {
                sender: &me.to_hex(),
                recipient: &peer.to_hex(),
                plaintext: plaintext.as_bytes(),
                timestamp: unix_now() as i64,
                group_uuid: None,
                ciphertext_hash: "",
            })
            .await?;

        match self.attempt_send(&id).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(message = %id, error = %e, "send attempt failed");
                self.debug_ring.push(format!("send {id} failed: {}", e.code()));
            }
        }
        Ok(id)
    }

    /// One transmission attempt for a stored outgoing message.
    /// PENDING stays PENDING on key-resolution failure; transport
    /// failure flips to FAILED and bumps retry_count.
    pub(crate) async fn attempt_send(&self, message_id: &str) -> Result<(), EngineError> {
        let row = self.store.get_message(message_id).await?;
        if row.status == "RECEIVED" {
            return Ok(());
        }
        let peer = Fingerprint::from_hex(&row.recipient)
            .map_err(|_| EngineError::Internal("stored recipient corrupt".into()))?;

        // Recipient key first: failure keeps the message PENDING.
        let peer_kem = self.resolve_kem_key(&peer).await?;

        let plaintext = self.store.decrypt_value(&row.body_enc).await?;
        let now = unix_now();

        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::NoIdentity);
        };

        let sealed = envelope::seal(
            &session.sign_secret,
            &session.sign_public,
            &[session.kem_public.clone(), peer_kem],
            &plaintext,
            row.timestamp as u64,
        )?;
        let hash = hex::encode(sha3_256(&sealed));
        self.store.set_ciphertext_hash(message_id, &hash).await?;

        let entry = OutboxEntry::new(
            row.offline_seq as u64,
            now,
            session.fingerprint.to_hex(),
            peer.to_hex(),
            &sealed,
        );

        // Per-contact serialisation of the read-modify-publish cycle.
        let bucket_lock = self.outbox_lock(&peer.to_hex());
        let _held = bucket_lock.lock().await;
        let publish = outbox::publish_direct(
            &self.chunked,
            &session.fingerprint,
            &peer,
            day_of(now),
            entry,
            &session.sign_secret,
            &session.sign_public,
        )
        .await;
        drop(_held);
        drop(guard);

        match publish {
            Ok(()) => {
                self.store.set_status(message_id, MessageStatus::Sent).await?;
                self.events.emit(Event::MessageStatusChanged {
                    id: message_id.to_string(),
                    new_status: MessageStatus::Sent,
                });
                // The peer's standing ACK may already cover this send.
                self.apply_peer_ack(&peer).await;
                Ok(())
            }
            Err(e) => {
                // Auth-class failures are terminal; network-class ones
                // stay eligible for the retry sweep.
                if self.retry.should_retry(&e, (row.retry_count + 1) as u32) {
                    self.store.mark_failed(message_id).await?;
                } else {
                    self.store.mark_failed_terminal(message_id).await?;
                }
                self.events.emit(Event::MessageStatusChanged {
                    id: message_id.to_string(),
                    new_status: MessageStatus::Failed,
                });
                Err(e.into())
            }
        }
    }

    /// Read the peer's ACK record and flip covered SENT messages.
    pub(crate) async fn apply_peer_ack(&self, peer: &Fingerprint) {
        let me = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                Some(session) => session.fingerprint,
                None => return,
            }
        };
        let acked = match read_ack(&**self.chunked.dht(), peer, &me).await {
            Ok(Some(at)) => at,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "ack read failed");
                return;
            }
        };
        match self.store.mark_received_up_to(&peer.to_hex(), acked as i64).await {
            Ok(flipped) => {
                for id in flipped {
                    self.events.emit(Event::MessageStatusChanged {
                        id,
                        new_status: MessageStatus::Received,
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "ack application failed"),
        }
    }

    /// Foreground sync: fetch, store, and acknowledge.
    pub async fn check_offline_messages(&self) -> Result<(), EngineError> {
        self.sync_all_contacts(false).await
    }

    /// Background sync: identical fetch pipeline but NO ACK publish,
    /// so senders don't see RECEIVED before the user could.
    pub async fn check_offline_messages_cached(&self) -> Result<(), EngineError> {
        self.sync_all_contacts(true).await
    }

    pub(crate) async fn sync_all_contacts(&self, cached: bool) -> Result<(), EngineError> {
        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };
        let peers = self.store.known_peers(&me.to_hex()).await?;
        for peer_hex in peers {
            if let Ok(peer) = Fingerprint::from_hex(&peer_hex) {
                if let Err(e) = self.sync_contact(&peer, cached).await {
                    tracing::warn!(peer = %peer.short(), error = %e, "contact sync failed");
                }
            }
        }
        Ok(())
    }

    /// Smart sync against one contact: recent contacts get a 3-day
    /// window, stale ones the full 8-day retention.
    pub(crate) async fn sync_contact(&self, peer: &Fingerprint, cached: bool) -> Result<(), EngineError> {
        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };
        let now = unix_now();
        let last = self.store.last_sync(&peer.to_hex()).await?.map(|t| t as u64);
        let days = dna_spillway::sync::sync_window(now, last);

        let mut fetched_any = false;
        for day in days {
            let base = outbox_base(peer, &me, day);
            let buckets = match outbox::fetch_buckets(&self.chunked, &base).await {
                Ok(buckets) => buckets,
                Err(TransportError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            for (writer, entries) in buckets {
                // The bucket must be signed by the claimed sender.
                let Ok(writer_key) = dna_crypto::sign::SignPublicKey::from_bytes(&writer) else {
                    continue;
                };
                if &Fingerprint::from_sign_public(&writer_key) != peer {
                    tracing::warn!(peer = %peer.short(), "bucket writer does not match contact");
                    continue;
                }
                for entry in entries {
                    if entry.expiry < now {
                        continue;
                    }
                    if let Err(e) = self.process_incoming_direct(&entry, cached).await {
                        tracing::warn!(error = %e, "incoming message dropped");
                    }
                }
            }
            fetched_any = true;
        }

        self.store.set_last_sync(&peer.to_hex(), now as i64).await?;
        self.apply_peer_ack(peer).await;

        if !cached && fetched_any {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if let Err(e) = publish_ack(
                    &**self.chunked.dht(),
                    &me,
                    peer,
                    now,
                    &session.sign_secret,
                    &session.sign_public,
                )
                .await
                {
                    tracing::debug!(error = %e, "ack publish failed");
                } else {
                    self.store.set_ack_published(&peer.to_hex(), now as i64).await?;
                }
            }
        }
        Ok(())
    }

    /// Decrypt-verify-store one fetched outbox entry.
    async fn process_incoming_direct(
        &self,
        entry: &OutboxEntry,
        arrived_offline: bool,
    ) -> Result<(), EngineError> {
        let ciphertext = entry.ciphertext().map_err(EngineError::from)?;
        let hash = hex::encode(sha3_256(&ciphertext));

        let opened = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            envelope::open(&session.kem_secret, &ciphertext)?
        };
        let sender = opened.sender;

        // Resolve the sender key; failure defers verification rather
        // than dropping the message.
        let verified = match self.resolve_sign_key(&sender).await {
            Some(key) => match opened.verify_sender(&key) {
                Ok(()) => true,
                Err(_) => {
                    // A resolved key and a bad signature is terminal.
                    self.events.emit(Event::Error {
                        code: "signature_invalid".into(),
                        message: format!("discarded forged message claiming {}", sender.short()),
                    });
                    return Err(EngineError::SignatureInvalid);
                }
            },
            None => false,
        };

        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };

        let inserted = self
            .store
            .insert_incoming(NewIncoming {
                sender: &sender.to_hex(),
                recipient: &me.to_hex(),
                plaintext: &opened.plaintext,
                timestamp: opened.timestamp as i64,
                group_uuid: None,
                offline_seq: entry.offline_seq as i64,
                ciphertext_hash: &hash,
                arrived_offline,
                verified,
                signature_b64: (!verified).then(|| {
                    base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        opened.signature(),
                    )
                }),
            })
            .await?;

        if let Some(id) = inserted {
            self.events.emit(Event::MessageReceived {
                message: MessageView {
                    id,
                    sender: sender.to_hex(),
                    recipient: me.to_hex(),
                    plaintext: String::from_utf8_lossy(&opened.plaintext).into_owned(),
                    timestamp: opened.timestamp,
                    group_uuid: None,
                    verified,
                    status: MessageStatus::Received.as_str().to_string(),
                },
            });
        }
        Ok(())
    }

    /// Re-attempt every FAILED-but-retryable and stuck-PENDING
    /// outgoing message. Returns how many were retried.
    pub async fn retry_pending_messages(&self) -> Result<u64, EngineError> {
        let mut rows: Vec<MessageRow> = self.store.failed_retryable().await?;
        rows.extend(self.store.stuck_pending().await?);

        let mut retried = 0u64;
        for row in rows {
            match self.attempt_send(&row.id).await {
                Ok(()) => retried += 1,
                Err(e) => {
                    tracing::debug!(message = %row.id, error = %e, "retry attempt failed")
                }
            }
        }

        // Piggyback the deferred-signature sweep on the same trigger.
        self.verify_deferred_messages().await;
        Ok(retried)
    }

    /// Retry signature verification for messages whose sender key was
    /// unresolvable at delivery time. Verified rows flip to
    /// verified=true; proven forgeries are deleted.
    pub(crate) async fn verify_deferred_messages(&self) {
        let rows = match self.store.unverified_messages().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "deferred verification scan failed");
                return;
            }
        };
        for row in rows {
            let Ok(sender) = Fingerprint::from_hex(&row.sender_fingerprint) else {
                continue;
            };
            let Some(key) = self.resolve_sign_key(&sender).await else {
                continue; // still unresolvable, keep deferring
            };
            let (Ok(plaintext), Some(sig_b64)) =
                (self.store.decrypt_value(&row.body_enc).await, row.signature_b64.as_ref())
            else {
                continue;
            };
            let Ok(signature) = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                sig_b64,
            ) else {
                continue;
            };

            if dna_crypto::sign::verify(&key, &plaintext, &signature) {
                if self.store.mark_verified(&row.id).await.is_ok() {
                    self.events.emit(Event::MessageStatusChanged {
                        id: row.id,
                        new_status: MessageStatus::Received,
                    });
                }
            } else {
                tracing::warn!(sender = %sender.short(), "deferred verification failed, discarding");
                let _ = self.store.delete_message(&row.id).await;
                self.events.emit(Event::Error {
                    code: "signature_invalid".into(),
                    message: format!("discarded forged message claiming {}", sender.short()),
                });
            }
        }
    }

    /// Both directions of a conversation, decrypted into views.
    pub async fn get_conversation(&self, peer: &str) -> Result<Vec<MessageView>, EngineError> {
        let peer_fp = self.resolve_recipient(peer).await?;
        let me = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(EngineError::NoIdentity);
            };
            session.fingerprint
        };
        let rows = self.store.conversation(&me.to_hex(), &peer_fp.to_hex()).await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.row_to_view(row).await?);
        }
        Ok(views)
    }

    pub(crate) async fn row_to_view(&self, row: MessageRow) -> Result<MessageView, EngineError> {
        let plaintext = self.store.decrypt_value(&row.body_enc).await?;
        Ok(MessageView {
            id: row.id,
            sender: row.sender,
            recipient: row.recipient,
            plaintext: String::from_utf8_lossy(&plaintext).into_owned(),
            timestamp: row.timestamp as u64,
            group_uuid: row.group_uuid,
            verified: row.verified,
            status: row.status,
        })
    }

    /// Register a peer in the sync roster. Listen subscriptions for
    /// the roster are established at identity load and refreshed at
    /// day rotation. Idempotent.
    pub async fn add_contact(&self, who: &str) -> Result<String, EngineError> {
        let fp = self.resolve_recipient(who).await?;
        self.store.ensure_peer(&fp.to_hex()).await?;
        Ok(fp.to_hex())
    }
}
