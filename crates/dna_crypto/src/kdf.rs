//! PBKDF2-HMAC-SHA256 KEK derivation for keys at rest.
//!
//! The wrapped private-key files carry their own salt and iteration
//! count; the floor below rejects any count weak enough to indicate a
//! tampered header.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KDF_SALT_LEN: usize = 16;
pub const KDF_ITERATIONS: u32 = 210_000;

/// Derive a 32-byte KEK from a password and salt.
pub fn derive_kek(
    password: &[u8],
    salt: &[u8; KDF_SALT_LEN],
    iterations: u32,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if iterations < KDF_ITERATIONS {
        return Err(CryptoError::Kdf);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, out.as_mut());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_key() {
        let salt = [1u8; KDF_SALT_LEN];
        let a = derive_kek(b"hunter2", &salt, KDF_ITERATIONS).unwrap();
        let b = derive_kek(b"hunter2", &salt, KDF_ITERATIONS).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_password_different_key() {
        let salt = [1u8; KDF_SALT_LEN];
        let a = derive_kek(b"alpha", &salt, KDF_ITERATIONS).unwrap();
        let b = derive_kek(b"beta", &salt, KDF_ITERATIONS).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn weak_iteration_count_rejected() {
        let salt = [1u8; KDF_SALT_LEN];
        assert!(matches!(
            derive_kek(b"pw", &salt, 1000),
            Err(CryptoError::Kdf)
        ));
    }
}
