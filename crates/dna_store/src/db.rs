//! Database handle over SQLite via sqlx.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::error::StoreError;
use crate::vault::StoreVault;

/// Central store handle. Cheap to clone (pool is an Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: StoreVault,
}

impl Store {
    /// Open (or create) the database at `db_path` and run migrations.
    ///
    /// WAL and foreign keys are set at connection time, not inside a
    /// migration — SQLite refuses journal_mode changes inside the
    /// transaction sqlx wraps migrations in.
    pub async fn open(db_path: &Path, vault: StoreVault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(path = %db_path.display(), "message store opened");
        Ok(Self { pool, vault })
    }

    // ── Column encryption helpers ───────────────────────────────────────────

    /// Encrypt a value with the store key; base64 for the TEXT column.
    /// Wire form: nonce (12) ‖ ciphertext ‖ tag (16).
    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let nonce = dna_crypto::rng::csprng_array::<12>()?;
        self.vault
            .with_key(|key| {
                let (ct, tag) =
                    dna_crypto::aead::aead_encrypt(key, &nonce, b"dna-store-v1", plaintext)?;
                let mut out = Vec::with_capacity(12 + ct.len() + 16);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                out.extend_from_slice(&tag);
                Ok(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    out,
                ))
            })
            .await
    }

    /// Decrypt a store-encrypted column value.
    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|_| StoreError::Crypto(dna_crypto::CryptoError::InvalidCiphertext))?;
        if bytes.len() < 12 + 16 {
            return Err(StoreError::Crypto(dna_crypto::CryptoError::InvalidCiphertext));
        }
        self.vault
            .with_key(|key| {
                let nonce: &[u8; 12] = bytes[..12].try_into().unwrap();
                let tag: &[u8; 16] = bytes[bytes.len() - 16..].try_into().unwrap();
                let ct = &bytes[12..bytes.len() - 16];
                let pt = dna_crypto::aead::aead_decrypt(key, nonce, b"dna-store-v1", ct, tag)?;
                Ok(pt.to_vec())
            })
            .await
    }
}
