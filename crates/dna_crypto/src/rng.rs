//! OS CSPRNG access.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Handle to the operating system CSPRNG.
pub fn os_rng() -> OsRng {
    OsRng
}

/// `n` bytes of OS randomness.
pub fn csprng(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    OsRng.try_fill_bytes(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}

/// Fixed-size OS randomness (nonces, DEKs, GEKs, seeds).
pub fn csprng_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    OsRng.try_fill_bytes(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}
