//! Key-value storage for the bearer token and cached session data.
//!
//! The request layer only needs get/set/remove on string values. Two
//! implementations ship here: an in-memory store for tests and ephemeral
//! tools, and a JSON file store that persists atomically (temp file + rename)
//! with owner-only permissions on Unix.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempfile::NamedTempFile;

/// Bearer token.
pub const TOKEN_KEY: &str = "ngmToken";
/// Serialized [`ngm_types::UserProfile`].
pub const USER_KEY: &str = "ngmUser";
/// Serialized [`ngm_types::PermissionSnapshot`].
pub const PERMISSIONS_KEY: &str = "sidebar_permissions";
/// Table layout preference. Not session state; never cleared on logout.
pub const TABLE_LAYOUT_KEY: &str = "table_layout";

/// Everything removed when a session ends.
pub const SESSION_KEYS: [&str; 3] = [TOKEN_KEY, USER_KEY, PERMISSIONS_KEY];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to persist session store at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to serialize session store: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// The stored bearer token, if present and non-empty.
    fn token(&self) -> Option<String> {
        self.get(TOKEN_KEY).filter(|token| !token.trim().is_empty())
    }
}

type Entries = BTreeMap<String, String>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<Entries>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileTokenStore {
    /// Open the store at `path`.
    ///
    /// A missing file starts empty. A corrupt file is logged and treated as
    /// empty; it is replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Discarding unreadable session store: {e}");
                Entries::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Entries::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomically(&self.path, &bytes).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
