use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store key not loaded — load an identity first")]
    KeyNotLoaded,

    #[error("crypto error: {0}")]
    Crypto(#[from] dna_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("migration error: {0}")]
    Migration(String),
}
