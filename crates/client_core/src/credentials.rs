use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ClientError;

/// The access/refresh token pair for the authenticated session. Exactly one
/// live pair exists at a time; it is replaced whole on renewal and cleared
/// whole on logout or unrecoverable renewal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

/// Pure data access for the credential pair. Mutation happens only through
/// the renewer and the session facade; the request gateway and the realtime
/// connection only read.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<CredentialPair>;
    fn store(&self, pair: &CredentialPair) -> Result<(), ClientError>;
    fn clear(&self) -> Result<(), ClientError>;
}

/// JSON file on disk, with an in-process cache so reads on the request path
/// stay off the filesystem.
pub struct FileCredentialStore {
    path: PathBuf,
    cached: RwLock<Option<CredentialPair>>,
}

impl FileCredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CredentialPair>(&raw) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    warn!(path = %path.display(), "ignoring unreadable credential file: {err}");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path,
            cached: RwLock::new(cached),
        }
    }

    fn ensure_parent_dir(path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<CredentialPair> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, pair: &CredentialPair) -> Result<(), ClientError> {
        Self::ensure_parent_dir(&self.path)?;
        let raw = serde_json::to_string_pretty(pair)?;
        fs::write(&self.path, raw)?;
        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Volatile store for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<CredentialPair> {
        self.pair
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, pair: &CredentialPair) -> Result<(), ClientError> {
        *self
            .pair
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        *self
            .pair
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}
