//! The DHT contract, and an in-memory implementation for tests.
//!
//! The routing layer itself is out of scope: any DHT exposing signed
//! put, multi-writer get, and listen can back this trait. Values at
//! one key are discriminated by `(writer, value_id)`; a put with the
//! same pair REPLACES the previous value (the property the whole
//! outbox scheme leans on).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use dna_crypto::sign::{self, SignPublicKey, SignSecretKey};

use crate::error::TransportError;

/// A DHT key: 64-byte SHA3-512 output, or its 32-byte truncation for
/// chunk keys.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DhtKey(Vec<u8>);

impl DhtKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({}…)", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

/// One stored value as returned by `get_all`.
#[derive(Debug, Clone)]
pub struct DhtRecord {
    pub value: Vec<u8>,
    pub value_id: u64,
    /// Writer's ML-DSA-87 public key bytes (verified against the
    /// record signature before the record is surfaced).
    pub writer: Vec<u8>,
}

pub type ListenToken = u64;

/// Signing identity for `put_signed`.
#[derive(Clone, Copy)]
pub struct DhtWriter<'a> {
    pub secret: &'a SignSecretKey,
    pub public: &'a SignPublicKey,
}

/// The external DHT service contract.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Store `value` at `key`, signed, replacing any previous value by
    /// the same `(writer, value_id)` pair.
    async fn put_signed(
        &self,
        key: &DhtKey,
        value: Vec<u8>,
        value_id: u64,
        ttl: Duration,
        writer: DhtWriter<'_>,
    ) -> Result<(), TransportError>;

    /// All live values at `key`, one per `(writer, value_id)`.
    async fn get_all(&self, key: &DhtKey) -> Result<Vec<DhtRecord>, TransportError>;

    /// Subscribe to new values at `key`. Records are pushed into
    /// `sink`; the callback side must not block.
    async fn listen(
        &self,
        key: &DhtKey,
        sink: mpsc::Sender<DhtRecord>,
    ) -> Result<ListenToken, TransportError>;

    async fn cancel_listen(&self, token: ListenToken) -> Result<(), TransportError>;
}

/// Signing input: key ‖ value_id (BE) ‖ value.
fn signing_input(key: &DhtKey, value_id: u64, value: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(key.as_bytes().len() + 8 + value.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(&value_id.to_be_bytes());
    input.extend_from_slice(value);
    input
}

struct StoredRecord {
    value: Vec<u8>,
    value_id: u64,
    writer: Vec<u8>,
    signature: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct Listeners {
    by_token: HashMap<ListenToken, (DhtKey, mpsc::Sender<DhtRecord>)>,
}

/// In-process DHT with TTL expiry and listener fan-out. Shared between
/// engines in tests to simulate the network.
#[derive(Default)]
pub struct MemoryDht {
    records: Mutex<HashMap<DhtKey, HashMap<(Vec<u8>, u64), StoredRecord>>>,
    listeners: Mutex<Listeners>,
    next_token: AtomicU64,
    offline: AtomicBool,
}

impl MemoryDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate a network partition: every operation fails with
    /// `Network` until restored.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::Network("simulated partition".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put_signed(
        &self,
        key: &DhtKey,
        value: Vec<u8>,
        value_id: u64,
        ttl: Duration,
        writer: DhtWriter<'_>,
    ) -> Result<(), TransportError> {
        self.check_online()?;

        let signature = sign::sign(writer.secret, &signing_input(key, value_id, &value))
            .map_err(|_| TransportError::Storage("signing failed".into()))?;
        let record = StoredRecord {
            value: value.clone(),
            value_id,
            writer: writer.public.as_bytes().to_vec(),
            signature,
            expires_at: Instant::now() + ttl,
        };

        let pushed = DhtRecord {
            value,
            value_id,
            writer: writer.public.as_bytes().to_vec(),
        };

        {
            let mut records = self.records.lock();
            records
                .entry(key.clone())
                .or_default()
                .insert((pushed.writer.clone(), value_id), record);
        }

        // Fan out to listeners without holding the record lock.
        let sinks: Vec<mpsc::Sender<DhtRecord>> = {
            let listeners = self.listeners.lock();
            listeners
                .by_token
                .values()
                .filter(|(k, _)| k == key)
                .map(|(_, sink)| sink.clone())
                .collect()
        };
        for sink in sinks {
            // A full or closed sink is the subscriber's problem.
            let _ = sink.try_send(pushed.clone());
        }
        Ok(())
    }

    async fn get_all(&self, key: &DhtKey) -> Result<Vec<DhtRecord>, TransportError> {
        self.check_online()?;

        let now = Instant::now();
        let records = self.records.lock();
        let Some(per_writer) = records.get(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for stored in per_writer.values() {
            if stored.expires_at <= now {
                continue;
            }
            let Ok(public) = SignPublicKey::from_bytes(&stored.writer) else {
                continue;
            };
            if !sign::verify(
                &public,
                &signing_input(key, stored.value_id, &stored.value),
                &stored.signature,
            ) {
                tracing::warn!(key = %key.to_hex(), "dropping record with bad signature");
                continue;
            }
            out.push(DhtRecord {
                value: stored.value.clone(),
                value_id: stored.value_id,
                writer: stored.writer.clone(),
            });
        }
        Ok(out)
    }

    async fn listen(
        &self,
        key: &DhtKey,
        sink: mpsc::Sender<DhtRecord>,
    ) -> Result<ListenToken, TransportError> {
        self.check_online()?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .by_token
            .insert(token, (key.clone(), sink));
        Ok(token)
    }

    async fn cancel_listen(&self, token: ListenToken) -> Result<(), TransportError> {
        self.listeners.lock().by_token.remove(&token);
        Ok(())
    }
}
