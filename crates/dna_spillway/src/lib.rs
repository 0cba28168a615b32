//! dna_spillway — DHT-backed transport for DNA Messenger.
//!
//! The Spillway scheme turns a permissionless key-value store into a
//! reliable mailbox: every sender owns a daily bucket per recipient,
//! publishes it with a writer-stable value-id (so republishes replace
//! rather than accumulate), and recipients merge listen-pushes with
//! windowed polls. Delivery status comes back through per-contact ACK
//! records.
//!
//! # Modules
//! - `dht`       — the DHT contract trait + in-memory implementation
//! - `keys`      — derivation of every well-known DHT location
//! - `chunked`   — chunked value publish/fetch with hash short-circuit
//! - `outbox`    — daily buckets: entries, caps, publish, fetch
//! - `ack`       — delivery-receipt records
//! - `sync`      — smart-sync windows and the listen registry
//! - `bootstrap` — bootstrap node registry records
//! - `retry`     — backoff policy for network-class failures

pub mod ack;
pub mod bootstrap;
pub mod chunked;
pub mod dht;
pub mod error;
pub mod keys;
pub mod outbox;
pub mod retry;
pub mod sync;

pub use dht::{Dht, DhtKey, DhtRecord, ListenToken, MemoryDht};
pub use error::TransportError;
