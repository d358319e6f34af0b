//! Credential storage for protocol sessions.
//!
//! Each session owns one directory under the sessions tree holding its
//! serialized credentials, mirrored by at most one backup snapshot under
//! the backups tree. Directories are the unit of both backup and purge.
//!
//! A bundle is only ever trusted after structural validation: non-empty,
//! parses as JSON, and carries identity and platform fields. A session
//! whose primary copy fails validation falls back to its backup; if the
//! backup is invalid too, the whole directory pair is purged.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// File name of the serialized credentials inside a session directory.
pub const CREDENTIAL_FILE: &str = "creds.json";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential data is empty")]
    Empty,

    #[error("credential data is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("credential transfer payload is not valid base64: {0}")]
    Transfer(#[from] base64::DecodeError),
}

// ============================================================================
// CredentialBundle
// ============================================================================

/// Opaque serialized credentials for one session.
///
/// The runtime never interprets the material beyond the structural checks
/// in [`CredentialBundle::is_valid`]; everything else belongs to the
/// protocol client.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    raw: Value,
}

impl CredentialBundle {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Parse serialized credential bytes. Empty input is rejected before
    /// the JSON parser sees it, so the two failure modes stay distinct.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CredentialError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(CredentialError::Empty);
        }
        Ok(Self {
            raw: serde_json::from_slice(bytes)?,
        })
    }

    /// Structural validity: an object carrying non-empty `identity` and
    /// `platform` string fields.
    pub fn is_valid(&self) -> bool {
        self.identity().is_some() && self.string_field("platform").is_some()
    }

    /// The account identity this bundle authenticates, if present.
    pub fn identity(&self) -> Option<&str> {
        self.string_field("identity")
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    fn string_field(&self, name: &str) -> Option<&str> {
        match self.raw.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CredentialError> {
        Ok(serde_json::to_vec_pretty(&self.raw)?)
    }

    /// Encode for transfer inside a sub-session launch request.
    pub fn to_base64(&self) -> Result<String, CredentialError> {
        Ok(BASE64.encode(self.to_bytes()?))
    }

    /// Decode a transfer payload produced by [`CredentialBundle::to_base64`].
    pub fn from_base64(payload: &str) -> Result<Self, CredentialError> {
        let bytes = BASE64.decode(payload.trim())?;
        Self::from_slice(&bytes)
    }
}

// ============================================================================
// CredentialStore
// ============================================================================

/// Outcome of the startup credential check for one session directory.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialHealth {
    /// Primary copy passed validation.
    Valid(CredentialBundle),
    /// Primary was invalid; the backup passed validation and was copied
    /// back over the primary.
    Restored(CredentialBundle),
    /// Neither copy was usable; both directories were removed.
    Purged,
}

/// Filesystem store for session credentials and their backups.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    sessions_dir: PathBuf,
    backups_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(sessions_dir: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    pub fn credential_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CREDENTIAL_FILE)
    }

    fn backup_path(&self, session_id: &str) -> PathBuf {
        self.backups_dir.join(session_id).join(CREDENTIAL_FILE)
    }

    /// Load the primary credential copy. `Ok(None)` means no file exists;
    /// unparseable content is an error so callers can distinguish absent
    /// from corrupted.
    pub fn load(&self, session_id: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        read_bundle(&self.credential_path(session_id))
    }

    /// Persist the primary copy atomically: a concurrent `load` observes
    /// either the previous bundle or the new one, never a partial write.
    pub fn save(&self, session_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        write_bundle(&self.credential_path(session_id), bundle)
    }

    /// Snapshot the primary copy into the backup tree.
    pub fn backup(&self, session_id: &str) -> Result<PathBuf, CredentialError> {
        let bundle = match self.load(session_id)? {
            Some(b) => b,
            None => return Err(CredentialError::Empty),
        };
        let path = self.backup_path(session_id);
        write_bundle(&path, &bundle)?;
        Ok(path)
    }

    pub fn has_backup(&self, session_id: &str) -> bool {
        self.backup_path(session_id).is_file()
    }

    /// Copy the backup over the primary.
    pub fn restore_from_backup(&self, session_id: &str) -> Result<(), CredentialError> {
        let bundle = match read_bundle(&self.backup_path(session_id))? {
            Some(b) => b,
            None => return Err(CredentialError::Empty),
        };
        self.save(session_id, &bundle)
    }

    /// Remove the session directory and its backup. Missing directories
    /// are not an error.
    pub fn purge(&self, session_id: &str) -> Result<(), CredentialError> {
        remove_tree(&self.session_dir(session_id))?;
        remove_tree(&self.backups_dir.join(session_id))?;
        info!(session_id = %session_id, "Purged session credentials");
        Ok(())
    }

    /// Startup rule for an existing session directory: valid primary wins;
    /// an invalid primary falls back to a valid backup; otherwise the
    /// directory pair is purged.
    pub fn check(&self, session_id: &str) -> Result<CredentialHealth, CredentialError> {
        if let Some(bundle) = self.load_valid(&self.credential_path(session_id)) {
            return Ok(CredentialHealth::Valid(bundle));
        }

        if let Some(bundle) = self.load_valid(&self.backup_path(session_id)) {
            warn!(session_id = %session_id, "Primary credentials invalid, restoring backup");
            self.save(session_id, &bundle)?;
            return Ok(CredentialHealth::Restored(bundle));
        }

        self.purge(session_id)?;
        Ok(CredentialHealth::Purged)
    }

    /// Session ids that have an on-disk directory, in no particular order.
    pub fn list_session_ids(&self) -> Result<Vec<String>, CredentialError> {
        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CredentialError::Io(e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn load_valid(&self, path: &Path) -> Option<CredentialBundle> {
        match read_bundle(path) {
            Ok(Some(bundle)) if bundle.is_valid() => Some(bundle),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable credential file");
                None
            }
        }
    }
}

fn read_bundle(path: &Path) -> Result<Option<CredentialBundle>, CredentialError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CredentialError::Io(e)),
    };
    CredentialBundle::from_slice(&bytes).map(Some)
}

fn write_bundle(path: &Path, bundle: &CredentialBundle) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = bundle.to_bytes()?;
    let temp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(&temp_path, &contents)?;
    }

    // Atomic rename
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn remove_tree(path: &Path) -> Result<(), CredentialError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CredentialError::Io(e)),
    }
}
