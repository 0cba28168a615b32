//! AES-256-GCM with caller-supplied nonce and AAD.
//!
//! Key 32 B, nonce 12 B, tag 16 B, detached. Nonce discipline is the
//! caller's responsibility: every envelope draws a fresh random nonce
//! for a fresh random DEK, so nonce reuse requires a CSPRNG failure.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

/// Encrypt `plaintext`, authenticating `aad`.
/// Returns (ciphertext, detached 16-byte tag).
pub fn aead_encrypt(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; AEAD_TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    let mut combined = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::InvalidCiphertext)?;

    let split = combined.len() - AEAD_TAG_LEN;
    let mut tag = [0u8; AEAD_TAG_LEN];
    tag.copy_from_slice(&combined[split..]);
    combined.truncate(split);
    Ok((combined, tag))
}

/// Decrypt with a detached tag. Any mismatch in key, nonce, AAD,
/// ciphertext, or tag yields [`CryptoError::AuthTagMismatch`].
pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_LEN],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; AEAD_TAG_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;

    let mut combined = Vec::with_capacity(ciphertext.len() + AEAD_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::AuthTagMismatch)?;
    Ok(Zeroizing::new(plaintext))
}
