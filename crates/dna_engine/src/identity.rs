//! Identity sessions and wrapped key files.
//!
//! A session holds the unwrapped keypairs for one loaded identity.
//! On disk the identity is three DNAK files (signing key, KEM key,
//! master seed) plus a plaintext public record; the store key for the
//! local database derives from the master seed.
//!
//! Password change is a two-phase commit across the key files: new
//! files are staged as `.new`, a journal marker makes the switch
//! atomic, and recovery at load time rolls the change forward or back
//! so both files always open under the same password.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use dna_crypto::hash::sha3_512_concat;
use dna_crypto::kem::{kem_keypair, KemPublicKey, KemSecretKey};
use dna_crypto::rng::csprng_array;
use dna_crypto::sign::{self, sign_keypair, SignPublicKey, SignSecretKey};
use dna_proto::keyfile::{self, KeyKind};
use dna_proto::Fingerprint;

use crate::error::EngineError;

/// Deterministic seeds an identity derives from (mnemonic-derived in
/// the onboarding layer, random here for fresh identities).
#[derive(ZeroizeOnDrop)]
pub struct IdentitySeeds {
    pub signing: [u8; 32],
    pub encryption: [u8; 32],
    pub master: [u8; 64],
}

impl IdentitySeeds {
    pub fn random() -> Result<Self, EngineError> {
        Ok(Self {
            signing: csprng_array()?,
            encryption: csprng_array()?,
            master: csprng_array()?,
        })
    }
}

/// Unwrapped key material for the loaded identity. Secret halves are
/// zeroized when the session drops (shutdown or unload).
pub struct Session {
    pub fingerprint: Fingerprint,
    pub sign_public: SignPublicKey,
    pub sign_secret: SignSecretKey,
    pub kem_public: KemPublicKey,
    pub kem_secret: KemSecretKey,
    pub name: Option<String>,
}

/// Derive a session (and the database store key) from seeds.
pub fn session_from_seeds(
    seeds: &IdentitySeeds,
    name: Option<String>,
) -> Result<(Session, [u8; 32]), EngineError> {
    let (sign_public, sign_secret) = sign_keypair(&seeds.signing)?;
    let (kem_public, kem_secret) = kem_keypair(&seeds.encryption)?;
    let fingerprint = Fingerprint::from_sign_public(&sign_public);
    let store_key = derive_store_key(&seeds.master);
    Ok((
        Session { fingerprint, sign_public, sign_secret, kem_public, kem_secret, name },
        store_key,
    ))
}

fn derive_store_key(master: &[u8; 64]) -> [u8; 32] {
    let mut digest = sha3_512_concat(&[master, b"dna:store"]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    digest.zeroize();
    key
}

// ── Key files ────────────────────────────────────────────────────────────────

const DSA_FILE: &str = "identity.dsa";
const KEM_FILE: &str = "identity.kem";
const SEED_FILE: &str = "identity.seed";
const PUBLIC_FILE: &str = "identity.pub";
const JOURNAL_FILE: &str = "pwchange.journal";
const LOCK_FILE: &str = ".lock";

/// The plaintext companion record (public halves only).
#[derive(Serialize, Deserialize)]
struct PublicRecord {
    fingerprint: String,
    sign_public: String,
    kem_public: String,
    name: Option<String>,
}

/// The keys/ directory of one data dir.
pub struct KeyFiles {
    dir: PathBuf,
}

impl KeyFiles {
    pub fn new(data_dir: &Path) -> Self {
        Self { dir: data_dir.join("keys") }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn identity_exists(&self) -> bool {
        self.path(DSA_FILE).exists() && self.path(KEM_FILE).exists()
    }

    /// Persist a fresh identity. Fails if one already exists.
    pub fn save_new(
        &self,
        session: &Session,
        seeds: &IdentitySeeds,
        password: Option<&str>,
    ) -> Result<(), EngineError> {
        if self.identity_exists() {
            return Err(EngineError::InvalidArg("identity already exists".into()));
        }
        fs::create_dir_all(&self.dir)?;

        let dsa = keyfile::seal(KeyKind::Sign, session.sign_secret.as_bytes(), password)?;
        let kem = keyfile::seal(KeyKind::Kem, session.kem_secret.as_bytes(), password)?;
        let seed = keyfile::seal(KeyKind::Seed, &seeds.master, password)?;
        let public = serde_json::to_vec_pretty(&PublicRecord {
            fingerprint: session.fingerprint.to_hex(),
            sign_public: base64_encode(session.sign_public.as_bytes()),
            kem_public: base64_encode(session.kem_public.as_bytes()),
            name: session.name.clone(),
        })
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        fs::write(self.path(DSA_FILE), dsa)?;
        fs::write(self.path(KEM_FILE), kem)?;
        fs::write(self.path(SEED_FILE), seed)?;
        fs::write(self.path(PUBLIC_FILE), public)?;
        Ok(())
    }

    /// Remove a partially persisted identity (atomic-create rollback).
    pub fn discard(&self) {
        for file in [DSA_FILE, KEM_FILE, SEED_FILE, PUBLIC_FILE] {
            let _ = fs::remove_file(self.path(file));
        }
    }

    /// Load the identity, enforcing the fingerprint invariant.
    pub fn load(&self, password: Option<&str>) -> Result<(Session, [u8; 32]), EngineError> {
        self.recover_password_change()?;

        if !self.identity_exists() {
            return Err(EngineError::NotFound("no identity on disk".into()));
        }

        let public: PublicRecord = serde_json::from_slice(&fs::read(self.path(PUBLIC_FILE))?)
            .map_err(|e| EngineError::Internal(format!("public record corrupt: {e}")))?;

        let (kind, sign_bytes) = keyfile::open(&fs::read(self.path(DSA_FILE))?, password)?;
        if kind != KeyKind::Sign {
            return Err(EngineError::Internal("dsa file holds wrong key kind".into()));
        }
        let (kind, kem_bytes) = keyfile::open(&fs::read(self.path(KEM_FILE))?, password)?;
        if kind != KeyKind::Kem {
            return Err(EngineError::Internal("kem file holds wrong key kind".into()));
        }
        let (kind, master_bytes) = keyfile::open(&fs::read(self.path(SEED_FILE))?, password)?;
        if kind != KeyKind::Seed || master_bytes.len() != 64 {
            return Err(EngineError::Internal("seed file corrupt".into()));
        }

        let sign_public = SignPublicKey::from_bytes(&base64_decode(&public.sign_public)?)?;
        let kem_public = KemPublicKey::from_bytes(&base64_decode(&public.kem_public)?)?;
        let sign_secret = SignSecretKey::from_bytes(&sign_bytes)?;
        let kem_secret = KemSecretKey::from_bytes(&kem_bytes)?;

        // The in-memory fingerprint must equal SHA3-512 of the loaded
        // signing public key; mismatch aborts the session.
        let fingerprint = Fingerprint::from_sign_public(&sign_public);
        if fingerprint.to_hex() != public.fingerprint {
            return Err(EngineError::Internal("fingerprint mismatch, refusing session".into()));
        }
        // Probe-sign to bind the secret half to the public record.
        let probe = sign::sign(&sign_secret, b"dna:session-probe")?;
        if !sign::verify(&sign_public, b"dna:session-probe", &probe) {
            return Err(EngineError::Internal("signing key does not match public record".into()));
        }

        let master: [u8; 64] = master_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EngineError::Internal("seed file corrupt".into()))?;
        let store_key = derive_store_key(&master);

        let session = Session {
            fingerprint,
            sign_public,
            sign_secret,
            kem_public,
            kem_secret,
            name: public.name,
        };
        Ok((session, store_key))
    }

    /// Update the stored display name in the public record.
    pub fn set_name(&self, name: &str) -> Result<(), EngineError> {
        let mut public: PublicRecord = serde_json::from_slice(&fs::read(self.path(PUBLIC_FILE))?)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        public.name = Some(name.to_string());
        let bytes = serde_json::to_vec_pretty(&public)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        fs::write(self.path(PUBLIC_FILE), bytes)?;
        Ok(())
    }

    // ── Password change (two-phase) ─────────────────────────────────────────

    /// Rewrap every key file from `old` to `new`. Crash-safe: a kill at
    /// any point leaves all files opening under exactly one of the two
    /// passwords after [`Self::recover_password_change`].
    pub fn change_password(
        &self,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), EngineError> {
        self.recover_password_change()?;

        // Phase 0: verify the old password by opening everything.
        let (_, sign_bytes) = keyfile::open(&fs::read(self.path(DSA_FILE))?, old)?;
        let (_, kem_bytes) = keyfile::open(&fs::read(self.path(KEM_FILE))?, old)?;
        let (_, master_bytes) = keyfile::open(&fs::read(self.path(SEED_FILE))?, old)?;

        // Phase 1: stage new files. A crash here rolls back (no journal).
        let staged = [
            (DSA_FILE, keyfile::seal(KeyKind::Sign, &sign_bytes, new)?),
            (KEM_FILE, keyfile::seal(KeyKind::Kem, &kem_bytes, new)?),
            (SEED_FILE, keyfile::seal(KeyKind::Seed, &master_bytes, new)?),
        ];
        for (file, bytes) in &staged {
            fs::write(self.staged_path(file), bytes)?;
        }

        // Phase 2: journal, then switch. A crash after the journal is
        // rolled forward at next load.
        fs::write(self.path(JOURNAL_FILE), b"pwchange")?;
        for (file, _) in &staged {
            fs::rename(self.staged_path(file), self.path(file))?;
        }
        fs::remove_file(self.path(JOURNAL_FILE))?;
        Ok(())
    }

    fn staged_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("{file}.new"))
    }

    /// Complete or undo an interrupted password change.
    pub fn recover_password_change(&self) -> Result<(), EngineError> {
        let journal = self.path(JOURNAL_FILE);
        let files = [DSA_FILE, KEM_FILE, SEED_FILE];

        if journal.exists() {
            // Journal present: the switch was committed. Roll forward
            // whatever renames remain.
            for file in files {
                let staged = self.staged_path(file);
                if staged.exists() {
                    fs::rename(&staged, self.path(file))?;
                }
            }
            fs::remove_file(&journal)?;
            tracing::info!("rolled forward interrupted password change");
        } else {
            // No journal: staging was not committed. Roll back.
            for file in files {
                let staged = self.staged_path(file);
                if staged.exists() {
                    fs::remove_file(&staged)?;
                    tracing::info!("rolled back staged password change");
                }
            }
        }
        Ok(())
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, EngineError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
        .map_err(|e| EngineError::Internal(format!("public record base64: {e}")))
}

// ── Process-level identity lock ──────────────────────────────────────────────

/// OS-level lock enforcing single-process ownership of an identity.
/// The file is created exclusively and removed on drop.
pub struct IdentityLock {
    path: PathBuf,
}

impl IdentityLock {
    pub fn acquire(data_dir: &Path) -> Result<Self, EngineError> {
        let dir = data_dir.join("keys");
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(EngineError::Internal(
                "identity is locked by another process".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_identity(dir: &Path, password: Option<&str>) -> Fingerprint {
        let seeds = IdentitySeeds::random().unwrap();
        let (session, _) = session_from_seeds(&seeds, Some("alice".into())).unwrap();
        let fp = session.fingerprint;
        KeyFiles::new(dir).save_new(&session, &seeds, password).unwrap();
        fp
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fresh_identity(dir.path(), Some("alpha"));

        let files = KeyFiles::new(dir.path());
        assert!(files.identity_exists());
        let (session, store_key) = files.load(Some("alpha")).unwrap();
        assert_eq!(session.fingerprint, fp);
        assert_eq!(session.name.as_deref(), Some("alice"));
        assert_ne!(store_key, [0u8; 32]);
    }

    #[test]
    fn deterministic_sessions_from_same_seeds() {
        let seeds = IdentitySeeds::random().unwrap();
        let (a, key_a) = session_from_seeds(&seeds, None).unwrap();
        let (b, key_b) = session_from_seeds(&seeds, None).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn wrong_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fresh_identity(dir.path(), Some("alpha"));
        let files = KeyFiles::new(dir.path());
        assert!(matches!(files.load(Some("beta")), Err(EngineError::WrongPassword)));
        assert!(matches!(files.load(None), Err(EngineError::PasswordRequired)));
    }

    #[test]
    fn password_change_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fresh_identity(dir.path(), Some("alpha"));
        let files = KeyFiles::new(dir.path());

        files.change_password(Some("alpha"), Some("beta")).unwrap();
        assert!(matches!(files.load(Some("alpha")), Err(EngineError::WrongPassword)));
        let (session, _) = files.load(Some("beta")).unwrap();
        assert_eq!(session.fingerprint, fp);
    }

    #[test]
    fn crash_before_journal_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fresh_identity(dir.path(), Some("alpha"));
        let files = KeyFiles::new(dir.path());

        // Simulate a crash after staging one file, before the journal.
        let staged = keyfile::seal(KeyKind::Sign, b"garbage", Some("beta")).unwrap();
        fs::write(files.staged_path(DSA_FILE), staged).unwrap();

        let (session, _) = files.load(Some("alpha")).unwrap();
        assert_eq!(session.fingerprint, fp);
        assert!(!files.staged_path(DSA_FILE).exists());
    }

    #[test]
    fn crash_mid_switch_rolls_forward() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fresh_identity(dir.path(), Some("alpha"));
        let files = KeyFiles::new(dir.path());

        // Re-stage everything under "beta" and journal, then simulate a
        // crash after only the first rename.
        let (_, sign_bytes) = keyfile::open(&fs::read(files.path(DSA_FILE)).unwrap(), Some("alpha")).unwrap();
        let (_, kem_bytes) = keyfile::open(&fs::read(files.path(KEM_FILE)).unwrap(), Some("alpha")).unwrap();
        let (_, master_bytes) = keyfile::open(&fs::read(files.path(SEED_FILE)).unwrap(), Some("alpha")).unwrap();
        fs::write(
            files.staged_path(KEM_FILE),
            keyfile::seal(KeyKind::Kem, &kem_bytes, Some("beta")).unwrap(),
        )
        .unwrap();
        fs::write(
            files.staged_path(SEED_FILE),
            keyfile::seal(KeyKind::Seed, &master_bytes, Some("beta")).unwrap(),
        )
        .unwrap();
        fs::write(files.path(JOURNAL_FILE), b"pwchange").unwrap();
        // The .dsa rename already "happened":
        fs::write(
            files.path(DSA_FILE),
            keyfile::seal(KeyKind::Sign, &sign_bytes, Some("beta")).unwrap(),
        )
        .unwrap();

        // Recovery must finish the switch: everything opens under beta.
        let (session, _) = files.load(Some("beta")).unwrap();
        assert_eq!(session.fingerprint, fp);
        assert!(matches!(files.load(Some("alpha")), Err(EngineError::WrongPassword)));
    }

    #[test]
    fn lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::acquire(dir.path()).unwrap();
        assert!(IdentityLock::acquire(dir.path()).is_err());
        drop(lock);
        assert!(IdentityLock::acquire(dir.path()).is_ok());
    }
}
