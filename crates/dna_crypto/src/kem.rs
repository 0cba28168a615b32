//! ML-KEM-1024 (FIPS 203) key encapsulation.
//!
//! Public key 1568 B, secret key 3168 B, ciphertext 1568 B, shared
//! secret 32 B. Keypair generation is deterministic from a 32-byte
//! seed: the seed drives a ChaCha20 stream that stands in for the
//! keygen's randomness, so the same seed always yields the same
//! keypair (identity restore from a mnemonic-derived seed).

use fips203::ml_kem_1024;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::rng;

pub const KEM_PUBLIC_KEY_LEN: usize = ml_kem_1024::EK_LEN; // 1568
pub const KEM_SECRET_KEY_LEN: usize = ml_kem_1024::DK_LEN; // 3168
pub const KEM_CIPHERTEXT_LEN: usize = ml_kem_1024::CT_LEN; // 1568
pub const SHARED_SECRET_LEN: usize = 32;

/// ML-KEM-1024 encapsulation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

impl KemPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn inner(&self) -> Result<ml_kem_1024::EncapsKey, CryptoError> {
        let arr: [u8; KEM_PUBLIC_KEY_LEN] =
            self.0.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
        ml_kem_1024::EncapsKey::try_from_bytes(arr).map_err(|_| CryptoError::InvalidKey)
    }
}

/// ML-KEM-1024 decapsulation key. Wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct KemSecretKey(Vec<u8>);

impl KemSecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_SECRET_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn inner(&self) -> Result<ml_kem_1024::DecapsKey, CryptoError> {
        let arr: [u8; KEM_SECRET_KEY_LEN] =
            self.0.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
        ml_kem_1024::DecapsKey::try_from_bytes(arr).map_err(|_| CryptoError::InvalidKey)
    }
}

/// 32-byte KEM shared secret. Wiped on drop; used as a KEK for
/// RFC 3394 wrapping and never stored.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

/// Deterministic keypair from a 32-byte seed.
pub fn kem_keypair(seed: &[u8; 32]) -> Result<(KemPublicKey, KemSecretKey), CryptoError> {
    let mut seeded = ChaCha20Rng::from_seed(*seed);
    let (ek, dk) =
        ml_kem_1024::KG::try_keygen_with_rng(&mut seeded).map_err(|_| CryptoError::Rng)?;
    Ok((
        KemPublicKey(ek.into_bytes().to_vec()),
        KemSecretKey(dk.into_bytes().to_vec()),
    ))
}

/// Encapsulate a fresh shared secret to `public`.
/// Returns (ciphertext 1568 B, shared secret 32 B).
pub fn kem_encap(public: &KemPublicKey) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
    let ek = public.inner()?;
    let mut os = rng::os_rng();
    let (ssk, ct) = ek.try_encaps_with_rng(&mut os).map_err(|_| CryptoError::Rng)?;
    Ok((ct.into_bytes().to_vec(), SharedSecret(ssk.into_bytes())))
}

/// Decapsulate `ciphertext` with our secret key.
///
/// ML-KEM decapsulation is implicit-rejection safe: a malformed but
/// well-sized ciphertext yields a pseudorandom secret rather than an
/// error, so downstream unwrap/AEAD steps provide the actual
/// authenticity check.
pub fn kem_decap(secret: &KemSecretKey, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
    let arr: [u8; KEM_CIPHERTEXT_LEN] = ciphertext
        .try_into()
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    let ct = ml_kem_1024::CipherText::try_from_bytes(arr)
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    let dk = secret.inner()?;
    let ssk = dk.try_decaps(&ct).map_err(|_| CryptoError::InvalidCiphertext)?;
    Ok(SharedSecret(ssk.into_bytes()))
}

impl Drop for KemPublicKey {
    fn drop(&mut self) {
        // Public halves are not secret, but clearing keeps the heap tidy
        // for identity teardown audits.
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_keypair_from_seed() {
        let seed = [7u8; 32];
        let (pk1, sk1) = kem_keypair(&seed).unwrap();
        let (pk2, sk2) = kem_keypair(&seed).unwrap();
        assert_eq!(pk1.as_bytes(), pk2.as_bytes());
        assert_eq!(sk1.as_bytes(), sk2.as_bytes());
        assert_eq!(pk1.as_bytes().len(), KEM_PUBLIC_KEY_LEN);
        assert_eq!(sk1.as_bytes().len(), KEM_SECRET_KEY_LEN);
    }

    #[test]
    fn distinct_seeds_distinct_keys() {
        let (pk1, _) = kem_keypair(&[1u8; 32]).unwrap();
        let (pk2, _) = kem_keypair(&[2u8; 32]).unwrap();
        assert_ne!(pk1.as_bytes(), pk2.as_bytes());
    }

    #[test]
    fn encap_decap_round_trip() {
        let (pk, sk) = kem_keypair(&[3u8; 32]).unwrap();
        let (ct, ss_sender) = kem_encap(&pk).unwrap();
        assert_eq!(ct.len(), KEM_CIPHERTEXT_LEN);
        let ss_recipient = kem_decap(&sk, &ct).unwrap();
        assert_eq!(ss_sender.as_bytes(), ss_recipient.as_bytes());
    }

    #[test]
    fn decap_wrong_size_ciphertext_rejected() {
        let (_, sk) = kem_keypair(&[4u8; 32]).unwrap();
        assert!(matches!(
            kem_decap(&sk, &[0u8; 100]),
            Err(CryptoError::InvalidCiphertext)
        ));
    }

    #[test]
    fn public_key_wrong_size_rejected() {
        assert!(matches!(
            KemPublicKey::from_bytes(&[0u8; 32]),
            Err(CryptoError::InvalidKey)
        ));
    }
}
