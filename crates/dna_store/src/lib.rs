//! dna_store — Encrypted local database for DNA Messenger
//!
//! # Encryption strategy
//! SQLite does not natively encrypt. Message bodies are stored as
//! AES-256-GCM ciphertext under a store key derived from the loaded
//! identity's master seed; the key lives in the [`vault::StoreVault`]
//! only while an identity session is open. Metadata needed for
//! queries (fingerprints, timestamps, status) stays plain.
//!
//! # Migration
//! SQLx migrations in `migrations/` run on open.

pub mod db;
pub mod error;
pub mod groups;
pub mod messages;
pub mod models;
pub mod profiles;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
