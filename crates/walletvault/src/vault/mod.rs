//! Encrypted secret vault.
//!
//! A [`SecretVault`] is an explicit session object: it owns the derived key and
//! the map of secret name to sealed blob behind one reader/writer lock. When it
//! is file-backed, every mutation rewrites the vault file before the write lock
//! is released, so the in-memory map and the file never diverge.

pub mod crypto;

use crate::errors::VaultError;
use base64::Engine as _;
use fs2::FileExt;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

pub const VAULT_FILE_VERSION: u32 = 1;
const SENTINEL_PLAINTEXT: &[u8] = b"walletvault-check";
const SENTINEL_LABEL: &str = "<check>";

/// The narrow secret-store contract the wallet coordinator depends on.
pub trait SecretStore {
    fn get(&self, key: &str) -> Result<SecretString, VaultError>;
    fn set(&self, key: &str, secret: &str) -> Result<(), VaultError>;
    /// Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), VaultError>;
    fn list(&self) -> Result<BTreeSet<String>, VaultError>;
}

const fn default_version() -> u32 {
    VAULT_FILE_VERSION
}

/// On-disk shape. `data` maps secret names to `base64(nonce || ct || tag)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    #[serde(default = "default_version")]
    version: u32,
    salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    check: Option<String>,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl VaultFile {
    fn read(path: &Path) -> Result<Self, VaultError> {
        let s = fs::read_to_string(path).map_err(|e| VaultError::io(path, e))?;
        let v: Self = serde_json::from_str(&s)
            .map_err(|e| VaultError::Corrupt(format!("parse {}: {e}", path.display())))?;
        if v.version != VAULT_FILE_VERSION {
            return Err(VaultError::UnsupportedVersion(v.version));
        }
        Ok(v)
    }

    fn salt(&self) -> Result<[u8; crypto::SALT_LEN], VaultError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.salt)
            .map_err(|e| VaultError::Corrupt(format!("decode salt: {e}")))?;
        <[u8; crypto::SALT_LEN]>::try_from(bytes.as_slice())
            .map_err(|e| VaultError::Corrupt(format!("salt must be 16 bytes: {e}")))
    }
}

struct Session {
    key: crypto::VaultKey,
    salt: [u8; crypto::SALT_LEN],
    check: Option<String>,
    entries: BTreeMap<String, String>,
    // Held for the lifetime of a file-backed session.
    lock: Option<File>,
}

impl Session {
    fn to_file(&self) -> VaultFile {
        VaultFile {
            version: VAULT_FILE_VERSION,
            salt: base64::engine::general_purpose::STANDARD.encode(self.salt),
            check: self.check.clone(),
            data: self.entries.clone(),
        }
    }

    fn release_lock(&mut self) {
        if let Some(f) = self.lock.take() {
            if let Err(e) = FileExt::unlock(&f) {
                tracing::warn!(error = %e, "failed to release vault lock");
            }
        }
    }
}

/// Try `key` against the sentinel, or the first stored entry for vaults that
/// predate the sentinel. A vault with neither accepts any key.
fn verify_key(
    key: &[u8; 32],
    check: Option<&str>,
    entries: &BTreeMap<String, String>,
) -> Result<(), VaultError> {
    let outcome = if let Some(blob) = check {
        crypto::open(key, blob, SENTINEL_LABEL).map(|pt| pt.as_slice() == SENTINEL_PLAINTEXT)
    } else if let Some((name, blob)) = entries.iter().next() {
        crypto::open(key, blob, name).map(|_pt| true)
    } else {
        return Ok(());
    };
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) | Err(VaultError::DecryptionFailed(_)) => Err(VaultError::IncorrectPassword),
        Err(e) => Err(e),
    }
}

fn ensure_password(password: &SecretString) -> Result<(), VaultError> {
    use secrecy::ExposeSecret as _;
    if password.expose_secret().is_empty() {
        return Err(VaultError::EmptyPassword);
    }
    Ok(())
}

pub struct SecretVault {
    path: Option<PathBuf>,
    state: RwLock<Option<Session>>,
}

// The session holds key material; never print it.
impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SecretVault {
    /// A vault that lives only in this process. Contents are lost on `close`.
    pub const fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(None),
        }
    }

    /// A vault persisted to `path`. Nothing is read until `create` or `unlock`.
    pub const fn file_backed(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            state: RwLock::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a persisted vault file is present at the configured path.
    pub fn exists(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }

    pub fn is_unlocked(&self) -> bool {
        self.read_state().is_ok_and(|s| s.is_some())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, Option<Session>>, VaultError> {
        self.state.read().map_err(|e| {
            tracing::error!(error = %e, "vault state lock poisoned");
            VaultError::Poisoned
        })
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, Option<Session>>, VaultError> {
        self.state.write().map_err(|e| {
            tracing::error!(error = %e, "vault state lock poisoned");
            VaultError::Poisoned
        })
    }

    fn lock_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("vault.json");
        path.with_file_name(format!("{name}.lock"))
    }

    /// Exclusive advisory lock so two processes cannot both write the file.
    fn acquire_file_lock(path: &Path) -> Result<File, VaultError> {
        let p = Self::lock_path(path);
        if let Some(parent) = p.parent() {
            crate::fsutil::ensure_private_dir(parent).map_err(|e| VaultError::fs(parent, &e))?;
        }
        let mut oo = OpenOptions::new();
        oo.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            oo.mode(crate::fsutil::MODE_FILE_PRIVATE);
        }
        let f = oo.open(&p).map_err(|e| VaultError::io(&p, e))?;
        // Fail fast rather than block a caller behind another process.
        match f.try_lock_exclusive() {
            Ok(()) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(VaultError::Busy),
            Err(e) => Err(VaultError::io(&p, e)),
        }
    }

    fn persist(&self, session: &Session) -> Result<(), VaultError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let s = serde_json::to_string_pretty(&session.to_file())
            .map_err(|e| VaultError::Corrupt(format!("serialize vault: {e}")))?;
        crate::fsutil::write_string_atomic_restrictive(
            path,
            &s,
            crate::fsutil::MODE_FILE_PRIVATE,
        )
        .map_err(|e| VaultError::fs(path, &e))?;
        tracing::debug!(path = %path.display(), entries = session.entries.len(), "vault persisted");
        Ok(())
    }

    fn location(&self) -> String {
        self.path
            .as_deref()
            .map_or_else(|| ":memory:".to_owned(), |p| p.display().to_string())
    }

    /// Initialize a new vault bound to `password` and leave it unlocked.
    pub fn create(&self, password: &SecretString) -> Result<(), VaultError> {
        ensure_password(password)?;
        let mut state = self.write_state()?;
        if state.is_some() || self.exists() {
            return Err(VaultError::AlreadyExists(self.location()));
        }

        let lock = match self.path.as_deref() {
            Some(p) => Some(Self::acquire_file_lock(p)?),
            None => None,
        };
        let salt = crypto::random_salt();
        let key = crypto::derive_vault_key(password, &salt)?;
        let check = crypto::seal(&key, SENTINEL_LABEL, SENTINEL_PLAINTEXT)?;
        let mut session = Session {
            key,
            salt,
            check: Some(check),
            entries: BTreeMap::new(),
            lock,
        };
        if let Err(e) = self.persist(&session) {
            session.release_lock();
            return Err(e);
        }
        *state = Some(session);
        tracing::info!(location = %self.location(), "vault created");
        Ok(())
    }

    /// Load the persisted vault and derive its key from `password`.
    ///
    /// The password is not verified here; a wrong password surfaces as
    /// `DecryptionFailed` on the first `get`. Call [`Self::test_password`] to
    /// check it up front.
    pub fn unlock(&self, password: &SecretString) -> Result<(), VaultError> {
        ensure_password(password)?;
        let mut state = self.write_state()?;
        if let Some(s) = state.as_ref() {
            let key = crypto::derive_vault_key(password, &s.salt)?;
            return verify_key(&key, s.check.as_deref(), &s.entries);
        }
        let Some(path) = self.path.as_deref() else {
            return Err(VaultError::NotInitialized);
        };
        if !path.exists() {
            return Err(VaultError::NotInitialized);
        }

        let mut lock = Some(Self::acquire_file_lock(path)?);
        let loaded = VaultFile::read(path).and_then(|file| {
            let salt = file.salt()?;
            let key = crypto::derive_vault_key(password, &salt)?;
            Ok((file, salt, key))
        });
        let (file, salt, key) = match loaded {
            Ok(v) => v,
            Err(e) => {
                if let Some(f) = lock.take() {
                    drop(FileExt::unlock(&f));
                }
                return Err(e);
            }
        };
        tracing::debug!(path = %path.display(), entries = file.data.len(), "vault loaded");
        *state = Some(Session {
            key,
            salt,
            check: file.check,
            entries: file.data,
            lock,
        });
        Ok(())
    }

    /// Check that `password` can decrypt this vault's data. Never mutates state.
    pub fn test_password(&self, password: &SecretString) -> Result<(), VaultError> {
        ensure_password(password)?;
        let state = self.read_state()?;
        if let Some(s) = state.as_ref() {
            let key = crypto::derive_vault_key(password, &s.salt)?;
            return verify_key(&key, s.check.as_deref(), &s.entries);
        }
        drop(state);

        let Some(path) = self.path.as_deref().filter(|p| p.exists()) else {
            return Err(VaultError::NotInitialized);
        };
        let file = VaultFile::read(path)?;
        let key = crypto::derive_vault_key(password, &file.salt()?)?;
        verify_key(&key, file.check.as_deref(), &file.data)
    }

    /// Re-encrypt every entry under a key derived from `new` with a fresh salt.
    pub fn change_password(
        &self,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<(), VaultError> {
        ensure_password(new)?;
        let mut state = self.write_state()?;
        let Some(session) = state.as_mut() else {
            return Err(VaultError::Locked);
        };
        let old_key = crypto::derive_vault_key(old, &session.salt)?;
        verify_key(&old_key, session.check.as_deref(), &session.entries)?;

        let salt = crypto::random_salt();
        let key = crypto::derive_vault_key(new, &salt)?;
        let mut entries = BTreeMap::new();
        for (name, blob) in &session.entries {
            let pt = crypto::open(&old_key, blob, name)?;
            entries.insert(name.clone(), crypto::seal(&key, name, &pt)?);
        }
        let check = crypto::seal(&key, SENTINEL_LABEL, SENTINEL_PLAINTEXT)?;
        let rotated = Session {
            key,
            salt,
            check: Some(check),
            entries,
            lock: session.lock.take(),
        };
        if let Err(e) = self.persist(&rotated) {
            session.lock = rotated.lock;
            return Err(e);
        }
        *session = rotated;
        tracing::info!(location = %self.location(), "vault password changed");
        Ok(())
    }

    /// Remove every entry and persist.
    pub fn clear(&self) -> Result<(), VaultError> {
        let mut state = self.write_state()?;
        let Some(session) = state.as_mut() else {
            return Err(VaultError::Locked);
        };
        session.entries.clear();
        self.persist(session)
    }

    /// Flush and lock the session. Safe to call more than once.
    pub fn close(&self) -> Result<(), VaultError> {
        let mut state = self.write_state()?;
        let Some(mut session) = state.take() else {
            return Ok(());
        };
        let flushed = self.persist(&session);
        session.release_lock();
        drop(session);
        tracing::debug!(location = %self.location(), "vault closed");
        flushed
    }
}

impl SecretStore for SecretVault {
    fn get(&self, key: &str) -> Result<SecretString, VaultError> {
        let state = self.read_state()?;
        let session = state.as_ref().ok_or(VaultError::Locked)?;
        let blob = session
            .entries
            .get(key)
            .ok_or_else(|| VaultError::NotFound(key.to_owned()))?;
        let pt = crypto::open(&session.key, blob, key)?;
        let s = std::str::from_utf8(&pt).map_err(|e| {
            tracing::debug!(key, error = %e, "decrypted secret is not utf-8");
            VaultError::DecryptionFailed(key.to_owned())
        })?;
        Ok(SecretString::new(s.into()))
    }

    /// The in-memory map is updated even when persisting fails; an `Io` error
    /// means the write is not durable, not that it did not happen.
    fn set(&self, key: &str, secret: &str) -> Result<(), VaultError> {
        let mut state = self.write_state()?;
        let session = state.as_mut().ok_or(VaultError::Locked)?;
        let blob = crypto::seal(&session.key, key, secret.as_bytes())?;
        session.entries.insert(key.to_owned(), blob);
        self.persist(session)
    }

    fn delete(&self, key: &str) -> Result<(), VaultError> {
        let mut state = self.write_state()?;
        let session = state.as_mut().ok_or(VaultError::Locked)?;
        if session.entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(session)
    }

    fn list(&self) -> Result<BTreeSet<String>, VaultError> {
        let state = self.read_state()?;
        let session = state.as_ref().ok_or(VaultError::Locked)?;
        Ok(session.entries.keys().cloned().collect())
    }
}
