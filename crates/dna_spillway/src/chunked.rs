//! Chunked value publish/fetch over the DHT.
//!
//! Publishing compresses and splits the logical value (see
//! `dna_proto::chunk`) and puts every chunk under its derived key with
//! the writer's stable value-id. Fetching reads chunk 0 for every
//! writer at the base key, short-circuits writers whose content hash
//! matches the local cache, and pulls remaining chunks in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;

use dna_crypto::sign::{SignPublicKey, SignSecretKey};
use dna_proto::chunk::{self, Chunk0Info};

use crate::dht::{Dht, DhtWriter};
use crate::error::TransportError;
use crate::keys::chunk_key;

/// Outcome of fetching one writer's value at a base key.
pub enum Fetched {
    /// Content hash matched the cache; no further chunks were fetched.
    Unchanged { writer: Vec<u8>, content_hash: [u8; 32] },
    /// Freshly reassembled value.
    Value { writer: Vec<u8>, content_hash: [u8; 32], value: Vec<u8> },
}

impl Fetched {
    pub fn writer(&self) -> &[u8] {
        match self {
            Self::Unchanged { writer, .. } | Self::Value { writer, .. } => writer,
        }
    }
}

/// Chunked store over a DHT handle, with the per-(base, writer) content
/// hash cache that backs the chunk-0 short circuit.
pub struct ChunkedStore {
    dht: Arc<dyn Dht>,
    hash_cache: Mutex<HashMap<(String, Vec<u8>), [u8; 32]>>,
}

impl ChunkedStore {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht, hash_cache: Mutex::new(HashMap::new()) }
    }

    pub fn dht(&self) -> &Arc<dyn Dht> {
        &self.dht
    }

    /// Publish `value` at `base` with the writer's stable value-id.
    /// All chunks carry the same ttl; replace semantics come from the
    /// (writer, value_id) pair.
    pub async fn publish(
        &self,
        base: &str,
        value: &[u8],
        value_id: u64,
        ttl: Duration,
        secret: &SignSecretKey,
        public: &SignPublicKey,
    ) -> Result<(), TransportError> {
        let set = chunk::split_value(value)?;
        for (index, chunk_bytes) in set.chunks.into_iter().enumerate() {
            let key = chunk_key(base, index as u32);
            self.dht
                .put_signed(
                    &key,
                    chunk_bytes,
                    value_id,
                    ttl,
                    DhtWriter { secret, public },
                )
                .await?;
        }
        // Our own publish is the freshest content for this base.
        self.hash_cache
            .lock()
            .insert((base.to_string(), public.as_bytes().to_vec()), set.content_hash);
        Ok(())
    }

    /// Fetch every writer's value at `base`. Writers whose chunk-0
    /// content hash matches the cache come back as `Unchanged`.
    pub async fn fetch_all(&self, base: &str) -> Result<Vec<Fetched>, TransportError> {
        let chunk0_records = self.dht.get_all(&chunk_key(base, 0)).await?;
        if chunk0_records.is_empty() {
            return Err(TransportError::NotFound);
        }

        let mut out = Vec::with_capacity(chunk0_records.len());
        for record in chunk0_records {
            let info = match chunk::parse_chunk0(&record.value) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(base, error = %e, "skipping malformed chunk 0");
                    continue;
                }
            };

            let cached = self
                .hash_cache
                .lock()
                .get(&(base.to_string(), record.writer.clone()))
                .copied();
            if cached == Some(info.content_hash) {
                out.push(Fetched::Unchanged {
                    writer: record.writer,
                    content_hash: info.content_hash,
                });
                continue;
            }

            match self
                .fetch_remaining(base, &record.writer, record.value_id, record.value, info)
                .await
            {
                Ok((value, content_hash)) => {
                    self.hash_cache
                        .lock()
                        .insert((base.to_string(), record.writer.clone()), content_hash);
                    out.push(Fetched::Value { writer: record.writer, content_hash, value });
                }
                Err(TransportError::AuthFailed) => {
                    // Never retried; drop this writer's value.
                    tracing::warn!(base, "chunked value failed verification");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Fetch only `writer`'s value (the publish path reads its own
    /// bucket back before appending). This is a correctness read, so
    /// the hash short-circuit is bypassed.
    pub async fn fetch_writer(
        &self,
        base: &str,
        writer: &[u8],
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.invalidate(base, writer);
        match self.fetch_all(base).await {
            Ok(values) => Ok(values.into_iter().find_map(|f| match f {
                Fetched::Value { writer: w, value, .. } if w == writer => Some(value),
                _ => None,
            })),
            Err(TransportError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop a cached hash (forces the next fetch to reassemble).
    pub fn invalidate(&self, base: &str, writer: &[u8]) {
        self.hash_cache
            .lock()
            .remove(&(base.to_string(), writer.to_vec()));
    }

    async fn fetch_remaining(
        &self,
        base: &str,
        writer: &[u8],
        value_id: u64,
        chunk0: Vec<u8>,
        info: Chunk0Info,
    ) -> Result<(Vec<u8>, [u8; 32]), TransportError> {
        let total = info.total_chunks as usize;
        let mut chunks: Vec<Option<Vec<u8>>> = vec![None; total];
        chunks[0] = Some(chunk0);

        // Chunks 1..N-1 in parallel, each filtered to this writer.
        let mut tasks = JoinSet::new();
        for index in 1..total as u32 {
            let dht = Arc::clone(&self.dht);
            let key = chunk_key(base, index);
            let writer = writer.to_vec();
            tasks.spawn(async move {
                let records = dht.get_all(&key).await?;
                let found = records
                    .into_iter()
                    .find(|r| r.writer == writer && r.value_id == value_id)
                    .ok_or(TransportError::NotFound)?;
                Ok::<(u32, Vec<u8>), TransportError>((index, found.value))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (index, value) =
                joined.map_err(|e| TransportError::Storage(e.to_string()))??;
            chunks[index as usize] = Some(value);
        }

        let complete: Vec<Vec<u8>> = chunks
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(TransportError::NotFound)?;
        let value = chunk::assemble(&complete)?;
        Ok((value, info.content_hash))
    }
}
