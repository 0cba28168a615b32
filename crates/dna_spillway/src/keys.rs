//! Derivation of every well-known DHT location.
//!
//! Fingerprints appear in key material as lowercase hex (the same form
//! users exchange). Base keys for chunked values are strings; the
//! per-chunk keys hash them down to 32 bytes.

use dna_crypto::hash::{sha3_512, sha3_512_concat};
use dna_proto::Fingerprint;

use crate::dht::DhtKey;

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Daily bucket index.
pub fn day_of(unix_time: u64) -> u64 {
    unix_time / SECONDS_PER_DAY
}

/// Writer-stable 64-bit value-id: the first 8 bytes of the writer's
/// fingerprint, big-endian. Guarantees replace semantics for all of a
/// writer's publishes at one key.
pub fn writer_value_id(fp: &Fingerprint) -> u64 {
    u64::from_be_bytes(fp.as_bytes()[..8].try_into().unwrap())
}

/// Profile record: `SHA3-512(fp ‖ ":profile")`.
pub fn profile_key(fp: &Fingerprint) -> DhtKey {
    DhtKey::from_bytes(&sha3_512_concat(&[fp.to_hex().as_bytes(), b":profile"]))
}

/// Name lookup mirror: `SHA3-512(name ‖ ":lookup")`.
pub fn name_lookup_key(name: &str) -> DhtKey {
    DhtKey::from_bytes(&sha3_512_concat(&[name.as_bytes(), b":lookup"]))
}

/// Delivery ACK: `SHA3-512(recipient ‖ ":ack:" ‖ sender)`.
/// Written by `recipient` about mail from `sender`.
pub fn ack_key(recipient: &Fingerprint, sender: &Fingerprint) -> DhtKey {
    DhtKey::from_bytes(&sha3_512_concat(&[
        recipient.to_hex().as_bytes(),
        b":ack:",
        sender.to_hex().as_bytes(),
    ]))
}

/// Direct-message outbox base key for one day.
pub fn outbox_base(sender: &Fingerprint, recipient: &Fingerprint, day: u64) -> String {
    format!("{}:outbox:{}:{}", sender.to_hex(), recipient.to_hex(), day)
}

/// Group outbox base key for one day (all members write here).
pub fn group_outbox_base(group_uuid: &str, day: u64) -> String {
    format!("dna:group:{group_uuid}:out:{day}")
}

/// IKP base key for one GEK version.
pub fn ikp_base(group_uuid: &str, version: u32) -> String {
    let digest = sha3_512_concat(&[
        group_uuid.as_bytes(),
        b":ikp:",
        version.to_string().as_bytes(),
    ]);
    hex::encode(digest)
}

/// Chunk `i` of a chunked value: `SHA3-512(base ‖ ":chunk:" ‖ i)[:32]`.
pub fn chunk_key(base: &str, index: u32) -> DhtKey {
    let digest = sha3_512_concat(&[
        base.as_bytes(),
        b":chunk:",
        index.to_string().as_bytes(),
    ]);
    DhtKey::from_bytes(&digest[..32])
}

/// The bootstrap node registry.
pub fn bootstrap_registry_key() -> DhtKey {
    DhtKey::from_bytes(&sha3_512(b"dna:bootstrap:registry"))
}
