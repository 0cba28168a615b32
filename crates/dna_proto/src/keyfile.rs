//! DNAK — password-wrapped private key files.
//!
//! ```text
//!  0  4  magic "DNAK"
//!  4  1  format version (1)
//!  5  1  key kind (1 = ML-DSA signing, 2 = ML-KEM encryption, 3 = master seed)
//!  6  1  protected flag (1 = non-empty password)
//!  7  4  PBKDF2 iterations u32 BE
//! 11 16  salt
//! 27 12  nonce
//! 39  .  AES-256-GCM ciphertext ‖ 16-byte tag, AAD = the 39-byte header
//! ```
//!
//! The KEK is PBKDF2-HMAC-SHA256(password, salt). An empty password is
//! still stretched, so unprotected files differ from protected ones
//! only by the flag and the input keying material.

use zeroize::Zeroizing;

use dna_crypto::aead::{aead_decrypt, aead_encrypt, AEAD_NONCE_LEN, AEAD_TAG_LEN};
use dna_crypto::kdf::{derive_kek, KDF_ITERATIONS, KDF_SALT_LEN};
use dna_crypto::rng::csprng_array;
use dna_crypto::CryptoError;

use crate::error::ProtoError;

pub const MAGIC: &[u8; 4] = b"DNAK";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 39;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Sign = 1,
    Kem = 2,
    Seed = 3,
}

impl KeyKind {
    fn from_byte(b: u8) -> Result<Self, ProtoError> {
        match b {
            1 => Ok(Self::Sign),
            2 => Ok(Self::Kem),
            3 => Ok(Self::Seed),
            _ => Err(ProtoError::Malformed("unknown key kind")),
        }
    }
}

/// Wrap secret key material for storage.
pub fn seal(kind: KeyKind, secret: &[u8], password: Option<&str>) -> Result<Vec<u8>, ProtoError> {
    let protected = password.is_some_and(|p| !p.is_empty());
    let salt = csprng_array::<KDF_SALT_LEN>()?;
    let nonce = csprng_array::<AEAD_NONCE_LEN>()?;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5] = kind as u8;
    header[6] = protected as u8;
    header[7..11].copy_from_slice(&KDF_ITERATIONS.to_be_bytes());
    header[11..27].copy_from_slice(&salt);
    header[27..39].copy_from_slice(&nonce);

    let kek = derive_kek(password.unwrap_or("").as_bytes(), &salt, KDF_ITERATIONS)?;
    let (ciphertext, tag) = aead_encrypt(&kek, &nonce, &header, secret)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len() + AEAD_TAG_LEN);
    out.extend_from_slice(&header);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Unwrap a key file.
///
/// `PasswordRequired` when the file is protected and no password was
/// given; `WrongPassword` when the derived KEK fails the tag.
pub fn open(bytes: &[u8], password: Option<&str>) -> Result<(KeyKind, Zeroizing<Vec<u8>>), ProtoError> {
    if bytes.len() < HEADER_LEN + AEAD_TAG_LEN {
        return Err(ProtoError::Malformed("key file truncated"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(ProtoError::Malformed("bad key file magic"));
    }
    if bytes[4] != VERSION {
        return Err(ProtoError::UnsupportedVersion(bytes[4]));
    }
    let kind = KeyKind::from_byte(bytes[5])?;
    let protected = bytes[6] == 1;
    if protected && password.map_or(true, str::is_empty) {
        return Err(ProtoError::PasswordRequired);
    }
    let iterations = u32::from_be_bytes(bytes[7..11].try_into().unwrap());
    let salt: &[u8; KDF_SALT_LEN] = bytes[11..27].try_into().unwrap();
    let nonce: &[u8; AEAD_NONCE_LEN] = bytes[27..39].try_into().unwrap();

    let kek = derive_kek(password.unwrap_or("").as_bytes(), salt, iterations)?;
    let tag_at = bytes.len() - AEAD_TAG_LEN;
    let tag: &[u8; AEAD_TAG_LEN] = bytes[tag_at..].try_into().unwrap();

    let secret = aead_decrypt(&kek, nonce, &bytes[..HEADER_LEN], &bytes[HEADER_LEN..tag_at], tag)
        .map_err(|e| match e {
            CryptoError::AuthTagMismatch => ProtoError::WrongPassword,
            other => ProtoError::Crypto(other),
        })?;
    Ok((kind, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let secret = vec![0xabu8; 4896];
        let file = seal(KeyKind::Sign, &secret, Some("alpha")).unwrap();
        let (kind, opened) = open(&file, Some("alpha")).unwrap();
        assert_eq!(kind, KeyKind::Sign);
        assert_eq!(*opened, secret);
    }

    #[test]
    fn wrong_password_rejected() {
        let file = seal(KeyKind::Kem, b"secret", Some("alpha")).unwrap();
        assert!(matches!(open(&file, Some("beta")), Err(ProtoError::WrongPassword)));
    }

    #[test]
    fn protected_file_requires_password() {
        let file = seal(KeyKind::Kem, b"secret", Some("alpha")).unwrap();
        assert!(matches!(open(&file, None), Err(ProtoError::PasswordRequired)));
        assert!(matches!(open(&file, Some("")), Err(ProtoError::PasswordRequired)));
    }

    #[test]
    fn unprotected_file_opens_without_password() {
        let file = seal(KeyKind::Seed, b"seed material", None).unwrap();
        let (kind, opened) = open(&file, None).unwrap();
        assert_eq!(kind, KeyKind::Seed);
        assert_eq!(*opened, b"seed material".to_vec());
    }

    #[test]
    fn tampered_header_rejected() {
        let mut file = seal(KeyKind::Sign, b"secret", Some("pw")).unwrap();
        file[10] ^= 0x01; // iterations field is authenticated via AAD
        // Either the KDF floor rejects the altered count or the tag fails.
        assert!(open(&file, Some("pw")).is_err());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let mut file = seal(KeyKind::Sign, b"secret", Some("pw")).unwrap();
        file[HEADER_LEN] ^= 0x01;
        assert!(matches!(open(&file, Some("pw")), Err(ProtoError::WrongPassword)));
    }
}
