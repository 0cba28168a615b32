//! SHA3 utilities.
//!
//! SHA3-512 produces the 64-byte identity fingerprints and every DHT
//! key; SHA3-256 produces chunk content hashes and ciphertext dedup
//! hashes.

use sha3::{Digest, Sha3_256, Sha3_512};

pub const SHA3_512_LEN: usize = 64;
pub const SHA3_256_LEN: usize = 32;

pub fn sha3_512(data: &[u8]) -> [u8; SHA3_512_LEN] {
    let mut out = [0u8; SHA3_512_LEN];
    out.copy_from_slice(&Sha3_512::digest(data));
    out
}

pub fn sha3_256(data: &[u8]) -> [u8; SHA3_256_LEN] {
    let mut out = [0u8; SHA3_256_LEN];
    out.copy_from_slice(&Sha3_256::digest(data));
    out
}

/// SHA3-512 over several segments without intermediate concatenation.
pub fn sha3_512_concat(segments: &[&[u8]]) -> [u8; SHA3_512_LEN] {
    let mut hasher = Sha3_512::new();
    for s in segments {
        hasher.update(s);
    }
    let mut out = [0u8; SHA3_512_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}
