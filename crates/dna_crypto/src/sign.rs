//! ML-DSA-87 (FIPS 204) detached signatures.
//!
//! Public key 2592 B, secret key 4896 B, signature 4627 B. Keypair
//! generation is deterministic from a 32-byte seed (same ChaCha20
//! construction as the KEM side). Signing uses the hedged mode with OS
//! randomness.

use fips204::ml_dsa_87;
use fips204::traits::{KeyGen, SerDes, Signer, Verifier};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::rng;

pub const SIGN_PUBLIC_KEY_LEN: usize = ml_dsa_87::PK_LEN; // 2592
pub const SIGN_SECRET_KEY_LEN: usize = ml_dsa_87::SK_LEN; // 4896
pub const SIGNATURE_LEN: usize = ml_dsa_87::SIG_LEN; // 4627

/// ML-DSA-87 verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignPublicKey(Vec<u8>);

impl SignPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGN_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// ML-DSA-87 signing key. Wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct SignSecretKey(Vec<u8>);

impl SignSecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGN_SECRET_KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Deterministic keypair from a 32-byte seed.
pub fn sign_keypair(seed: &[u8; 32]) -> Result<(SignPublicKey, SignSecretKey), CryptoError> {
    let mut seeded = ChaCha20Rng::from_seed(*seed);
    let (pk, sk) =
        ml_dsa_87::KG::try_keygen_with_rng(&mut seeded).map_err(|_| CryptoError::Rng)?;
    Ok((
        SignPublicKey(pk.into_bytes().to_vec()),
        SignSecretKey(sk.into_bytes().to_vec()),
    ))
}

/// Detached signature over `msg`. Always [`SIGNATURE_LEN`] bytes.
pub fn sign(secret: &SignSecretKey, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let arr: [u8; SIGN_SECRET_KEY_LEN] =
        secret.0.as_slice().try_into().map_err(|_| CryptoError::InvalidKey)?;
    let sk = ml_dsa_87::PrivateKey::try_from_bytes(arr).map_err(|_| CryptoError::InvalidKey)?;
    let mut os = rng::os_rng();
    let sig = sk
        .try_sign_with_rng(&mut os, msg, &[])
        .map_err(|_| CryptoError::Rng)?;
    Ok(sig.to_vec())
}

/// Verify a detached signature. The result is a plain bool; malformed
/// keys or signatures verify as false rather than erroring, so callers
/// cannot branch on the failure cause.
pub fn verify(public: &SignPublicKey, msg: &[u8], sig: &[u8]) -> bool {
    let Ok(pk_arr) = <[u8; SIGN_PUBLIC_KEY_LEN]>::try_from(public.0.as_slice()) else {
        return false;
    };
    let Ok(pk) = ml_dsa_87::PublicKey::try_from_bytes(pk_arr) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; SIGNATURE_LEN]>::try_from(sig) else {
        return false;
    };
    pk.verify(msg, &sig_arr, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_keypair_from_seed() {
        let seed = [9u8; 32];
        let (pk1, sk1) = sign_keypair(&seed).unwrap();
        let (pk2, sk2) = sign_keypair(&seed).unwrap();
        assert_eq!(pk1.as_bytes(), pk2.as_bytes());
        assert_eq!(sk1.as_bytes(), sk2.as_bytes());
        assert_eq!(pk1.as_bytes().len(), SIGN_PUBLIC_KEY_LEN);
        assert_eq!(sk1.as_bytes().len(), SIGN_SECRET_KEY_LEN);
    }

    #[test]
    fn sign_verify_round_trip() {
        let (pk, sk) = sign_keypair(&[5u8; 32]).unwrap();
        let msg = b"attack at dawn";
        let sig = sign(&sk, msg).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify(&pk, msg, &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (pk, sk) = sign_keypair(&[6u8; 32]).unwrap();
        let sig = sign(&sk, b"original").unwrap();
        assert!(!verify(&pk, b"tampered", &sig));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let (pk, sk) = sign_keypair(&[8u8; 32]).unwrap();
        let msg = b"payload";
        let mut sig = sign(&sk, msg).unwrap();
        sig[0] ^= 0x01;
        assert!(!verify(&pk, msg, &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (_, sk) = sign_keypair(&[10u8; 32]).unwrap();
        let (other_pk, _) = sign_keypair(&[11u8; 32]).unwrap();
        let sig = sign(&sk, b"msg").unwrap();
        assert!(!verify(&other_pk, b"msg", &sig));
    }

    #[test]
    fn truncated_signature_is_false_not_panic() {
        let (pk, sk) = sign_keypair(&[12u8; 32]).unwrap();
        let sig = sign(&sk, b"msg").unwrap();
        assert!(!verify(&pk, b"msg", &sig[..100]));
    }
}
