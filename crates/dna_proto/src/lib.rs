//! dna_proto — Wire formats for DNA Messenger
//!
//! Fixed binary layouts are hand-rolled (magic + sizes, no serde);
//! DHT-value payloads that tolerate evolution (profiles, outbox
//! buckets) are serde JSON.
//!
//! # Modules
//! - `envelope` — v0.08 encrypted message container (PQSIGENC)
//! - `ikp`      — Initial Key Packets distributing group keys (GEK )
//! - `chunk`    — DNAC v2 chunked+compressed DHT values
//! - `keyfile`  — DNAK password-wrapped private key files
//! - `identity` — fingerprints, names, signed public profiles

pub mod chunk;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod ikp;
pub mod keyfile;

pub use error::ProtoError;
pub use identity::Fingerprint;
