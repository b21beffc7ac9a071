//! Signed-in user and credential, persisted behind [`SessionStore`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use corkboard_core::{Credential, PresenceUser, SyncError, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: UserId,
    pub username: String,
}

impl SessionUser {
    pub fn presence(&self) -> PresenceUser {
        PresenceUser::new(self.id, self.username.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: SessionUser,
    pub credential: Credential,
}

impl Session {
    pub fn new(id: UserId, username: impl Into<String>, credential: Credential) -> Self {
        Self {
            user: SessionUser {
                id,
                username: username.into(),
            },
            credential,
        }
    }
}

/// Load/save boundary for the signed-in session.
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nobody is signed in.
    fn load(&self) -> Result<Option<Session>, SyncError>;

    fn save(&self, session: &Session) -> Result<(), SyncError>;

    /// Sign out. Clearing an empty store is not an error.
    fn clear(&self) -> Result<(), SyncError>;
}

/// JSON file on disk.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, SyncError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Session(format!("{}: {e}", self.path.display()))),
        };
        match serde_json::from_slice(&data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                log::warn!("Discarding unreadable session file {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), SyncError> {
        let data = serde_json::to_vec_pretty(session).map_err(|e| SyncError::Session(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::Session(format!("{}: {e}", parent.display())))?;
        }
        fs::write(&self.path, data).map_err(|e| SyncError::Session(format!("{}: {e}", self.path.display())))
    }

    fn clear(&self) -> Result<(), SyncError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Session(format!("{}: {e}", self.path.display()))),
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>, SyncError> {
        Ok(self.session.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, session: &Session) -> Result<(), SyncError> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SyncError> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ana() -> Session {
        Session::new(UserId(1), "ana", Credential::new("tok-ana"))
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(&ana()).unwrap();
        assert_eq!(store.load().unwrap(), Some(ana()));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_wire_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("session.json"));
        store.save(&ana()).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["user"]["username"], "ana");
        assert_eq!(raw["credential"], "tok-ana");
    }

    #[test]
    fn test_corrupt_file_reads_as_signed_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(FileSessionStore::new(path).load().unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&ana()).unwrap();
        assert_eq!(store.load().unwrap().map(|s| s.user.username), Some("ana".to_string()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_credential_not_in_debug() {
        assert!(!format!("{:?}", ana()).contains("tok-ana"));
    }
}
