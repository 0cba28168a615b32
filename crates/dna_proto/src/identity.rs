//! Fingerprints, registered names, and signed public profiles.
//!
//! A fingerprint is SHA3-512 of the ML-DSA-87 public key — the only
//! stable identifier exchanged between users. Profiles are published
//! to the DHT and mirrored under the name-lookup key; every record
//! must verify under its own embedded signing key.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use dna_crypto::hash::sha3_512;
use dna_crypto::kem::KemPublicKey;
use dna_crypto::sign::{self, SignPublicKey, SignSecretKey};

use crate::error::ProtoError;

pub const FINGERPRINT_LEN: usize = 64;

/// 64-byte identity fingerprint, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_sign_public(public: &SignPublicKey) -> Self {
        Self(sha3_512(public.as_bytes()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let arr: [u8; FINGERPRINT_LEN] = bytes
            .try_into()
            .map_err(|_| ProtoError::Malformed("fingerprint must be 64 bytes"))?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtoError> {
        let bytes = hex::decode(s).map_err(|_| ProtoError::Malformed("fingerprint hex"))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short display form for logs: first 8 hex chars.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", self.short())
    }
}

/// Registered-name rules: 3–20 chars, lowercase alphanumeric or
/// underscore, globally unique (uniqueness enforced at registration).
pub fn valid_name(name: &str) -> bool {
    (3..=20).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Public identity record published to the DHT.
///
/// `social` is opaque to the core (bio, avatar refs, wallet addresses)
/// and rides along under the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Monotonic record version; caches only replace on increase.
    pub version: u64,
    /// Hex fingerprint (matches the signing key below).
    pub fingerprint: String,
    /// Base64 ML-DSA-87 public key.
    pub sign_public_key: String,
    /// Base64 ML-KEM-1024 public key.
    pub kem_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Registration receipt for the name (opaque to the core).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_receipt: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub social: serde_json::Map<String, serde_json::Value>,
    /// Base64 detached ML-DSA-87 signature over the canonical JSON
    /// encoding with this field elided.
    pub signature: String,
}

impl Profile {
    pub fn new(
        version: u64,
        sign_public: &SignPublicKey,
        kem_public: &KemPublicKey,
        name: Option<String>,
    ) -> Self {
        Self {
            version,
            fingerprint: Fingerprint::from_sign_public(sign_public).to_hex(),
            sign_public_key: B64.encode(sign_public.as_bytes()),
            kem_public_key: B64.encode(kem_public.as_bytes()),
            name,
            name_receipt: None,
            social: serde_json::Map::new(),
            signature: String::new(),
        }
    }

    /// Canonical signing input: the record as JSON with the signature
    /// field elided. serde_json maps are ordered, so the encoding is
    /// deterministic.
    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or(ProtoError::Malformed("profile is not a JSON object"))?;
        obj.remove("signature");
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn sign_record(&mut self, secret: &SignSecretKey) -> Result<(), ProtoError> {
        let bytes = self.canonical_bytes()?;
        let sig = sign::sign(secret, &bytes)?;
        self.signature = B64.encode(sig);
        Ok(())
    }

    /// Verify the record under its own embedded signing key, and check
    /// that the embedded fingerprint matches that key.
    pub fn verify_record(&self) -> bool {
        let Ok(public) = self.sign_public() else {
            return false;
        };
        if Fingerprint::from_sign_public(&public).to_hex() != self.fingerprint {
            return false;
        }
        let Ok(bytes) = self.canonical_bytes() else {
            return false;
        };
        let Ok(sig) = B64.decode(&self.signature) else {
            return false;
        };
        sign::verify(&public, &bytes, &sig)
    }

    pub fn sign_public(&self) -> Result<SignPublicKey, ProtoError> {
        let bytes = B64
            .decode(&self.sign_public_key)
            .map_err(|_| ProtoError::Malformed("profile sign key base64"))?;
        Ok(SignPublicKey::from_bytes(&bytes)?)
    }

    pub fn kem_public(&self) -> Result<KemPublicKey, ProtoError> {
        let bytes = B64
            .decode(&self.kem_public_key)
            .map_err(|_| ProtoError::Malformed("profile kem key base64"))?;
        Ok(KemPublicKey::from_bytes(&bytes)?)
    }

    pub fn fingerprint(&self) -> Result<Fingerprint, ProtoError> {
        Fingerprint::from_hex(&self.fingerprint)
    }
}
