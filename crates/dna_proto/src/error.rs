use thiserror::Error;

use dna_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("malformed input: {0}")]
    Malformed(&'static str),

    #[error("unsupported version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("input exceeds size limit")]
    TooLarge,

    #[error("no recipient entry matches our key")]
    NoMatchingRecipient,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("chunk count {0} exceeds the maximum")]
    ChunkCount(u32),

    #[error("chunk CRC mismatch at index {0}")]
    ChunkCrc(u32),

    #[error("content hash mismatch after reassembly")]
    ContentHashMismatch,

    #[error("decompression failed")]
    Decompress,

    #[error("wrong password")]
    WrongPassword,

    #[error("password required")]
    PasswordRequired,

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
