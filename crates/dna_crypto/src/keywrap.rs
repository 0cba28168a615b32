//! RFC 3394 AES key wrap.
//!
//! Wraps a 32-byte DEK under a 32-byte KEK into a 40-byte blob. Used
//! for the per-recipient DEK entries in message envelopes and the
//! per-member GEK entries in Initial Key Packets.

use aes_kw::KekAes256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const WRAPPED_KEY_LEN: usize = 40;

/// Wrap `dek` under `kek`.
pub fn key_wrap(kek: &[u8; 32], dek: &[u8; 32]) -> Result<[u8; WRAPPED_KEY_LEN], CryptoError> {
    let kw = KekAes256::from(*kek);
    let mut wrapped = [0u8; WRAPPED_KEY_LEN];
    kw.wrap(dek, &mut wrapped).map_err(|_| CryptoError::InvalidKey)?;
    Ok(wrapped)
}

/// Unwrap a 40-byte blob back into the DEK. The RFC 3394 integrity
/// register doubles as the authenticity check: a wrong KEK or a
/// corrupted blob fails here.
pub fn key_unwrap(
    kek: &[u8; 32],
    wrapped: &[u8; WRAPPED_KEY_LEN],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let kw = KekAes256::from(*kek);
    let mut out = Zeroizing::new([0u8; 32]);
    kw.unwrap(wrapped, out.as_mut())
        .map_err(|_| CryptoError::AuthTagMismatch)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_identity() {
        let kek = [0x11u8; 32];
        let dek = [0x22u8; 32];
        let wrapped = key_wrap(&kek, &dek).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);
        let unwrapped = key_unwrap(&kek, &wrapped).unwrap();
        assert_eq!(*unwrapped, dek);
    }

    #[test]
    fn wrong_kek_rejected() {
        let wrapped = key_wrap(&[0x11u8; 32], &[0x22u8; 32]).unwrap();
        assert!(matches!(
            key_unwrap(&[0x33u8; 32], &wrapped),
            Err(CryptoError::AuthTagMismatch)
        ));
    }

    #[test]
    fn corrupted_blob_rejected() {
        let kek = [0x11u8; 32];
        let mut wrapped = key_wrap(&kek, &[0x22u8; 32]).unwrap();
        wrapped[8] ^= 0xff;
        assert!(matches!(
            key_unwrap(&kek, &wrapped),
            Err(CryptoError::AuthTagMismatch)
        ));
    }
}
