use thiserror::Error;

/// The only error surface of this crate. Variants are deliberately
/// coarse: callers must not be able to distinguish failure causes
/// beyond what they need for recovery decisions.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("authentication tag mismatch")]
    AuthTagMismatch,

    #[error("random number generator failure")]
    Rng,

    #[error("key derivation failure")]
    Kdf,
}
