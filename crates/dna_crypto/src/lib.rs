//! dna_crypto — DNA Messenger cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop and on every error path.
//! - Thin fixed-contract wrappers: callers never see crate-level error
//!   detail, only [`CryptoError`].
//!
//! # Module layout
//! - `kem`     — ML-KEM-1024 keypairs, encapsulation, decapsulation
//! - `sign`    — ML-DSA-87 keypairs, detached signatures, verification
//! - `aead`    — AES-256-GCM with caller-supplied nonce and AAD
//! - `keywrap` — RFC 3394 AES key wrap (32-byte DEK → 40-byte blob)
//! - `hash`    — SHA3-512 / SHA3-256
//! - `kdf`     — PBKDF2-HMAC-SHA256 KEK derivation for keys at rest
//! - `rng`     — OS CSPRNG
//! - `error`   — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod kem;
pub mod keywrap;
pub mod rng;
pub mod sign;

pub use error::CryptoError;

use zeroize::Zeroize;

/// Optimisation-resistant wipe of a secret-holding buffer.
pub fn zeroise(buf: &mut [u8]) {
    buf.zeroize();
}

/// Constant-time equality for digests and fingerprints.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
