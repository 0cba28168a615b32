//! The flat error taxonomy consumers see.

use thiserror::Error;

use dna_crypto::CryptoError;
use dna_proto::ProtoError;
use dna_spillway::TransportError;
use dna_store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("no identity loaded")]
    NoIdentity,

    #[error("wrong password")]
    WrongPassword,

    #[error("password required")]
    PasswordRequired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("operation timed out")]
    Timeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("key unavailable for {0}")]
    KeyUnavailable(String),

    #[error("database failure: {0}")]
    Database(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the event stream.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArg(_) => "invalid_arg",
            Self::NoIdentity => "no_identity",
            Self::WrongPassword => "wrong_password",
            Self::PasswordRequired => "password_required",
            Self::NotFound(_) => "not_found",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::AuthFailed => "auth_failed",
            Self::SignatureInvalid => "signature_invalid",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::Database(_) => "database",
            Self::Crypto(_) => "crypto",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthTagMismatch => Self::AuthFailed,
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<ProtoError> for EngineError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::WrongPassword => Self::WrongPassword,
            ProtoError::PasswordRequired => Self::PasswordRequired,
            ProtoError::SignatureInvalid => Self::SignatureInvalid,
            ProtoError::Crypto(CryptoError::AuthTagMismatch) => Self::AuthFailed,
            ProtoError::Crypto(c) => Self::Crypto(c.to_string()),
            ProtoError::TooLarge => Self::InvalidArg("input exceeds size limit".into()),
            ProtoError::Malformed(m) => Self::InvalidArg(m.to_string()),
            ProtoError::UnsupportedVersion(v) => {
                Self::InvalidArg(format!("unsupported format version {v:#04x}"))
            }
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::Timeout,
            TransportError::NotFound => Self::NotFound("dht key".into()),
            TransportError::AuthFailed => Self::AuthFailed,
            TransportError::Network(m) => Self::Network(m),
            TransportError::Serialize(m) => Self::Internal(m),
            TransportError::Storage(m) => Self::Internal(m),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::KeyNotLoaded => Self::NoIdentity,
            StoreError::Crypto(c) => c.into(),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Database(e.to_string())
    }
}
