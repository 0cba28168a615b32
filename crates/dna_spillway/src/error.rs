use thiserror::Error;

use dna_proto::ProtoError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("key not found")]
    NotFound,

    #[error("stored record failed authentication")]
    AuthFailed,

    #[error("serialisation failure: {0}")]
    Serialize(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl TransportError {
    /// Network-class failures are retried with backoff; authentication
    /// failures never are (the data is malicious or corrupted).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }
}

impl From<ProtoError> for TransportError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::SignatureInvalid
            | ProtoError::ContentHashMismatch
            | ProtoError::ChunkCrc(_)
            | ProtoError::Crypto(_) => Self::AuthFailed,
            ProtoError::Serialisation(err) => Self::Serialize(err.to_string()),
            other => Self::Serialize(other.to_string()),
        }
    }
}
