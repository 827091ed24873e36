use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use ballotbox_shared::Error;
use tracing::{trace, warn};

use crate::session::Session;

/// Where an active session survives a reload. Only the session record is
/// ever stored: never credentials, never proofs.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Result<Option<Session>, Error>;
    fn set(&self, session: &Session) -> Result<(), Error>;
    fn clear(&self) -> Result<(), Error>;
}

/// Keeps the session for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self) -> Result<Option<Session>, Error> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("session slot poisoned".into()))?;
        Ok(slot.clone())
    }

    fn set(&self, session: &Session) -> Result<(), Error> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("session slot poisoned".into()))?;
        *slot = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("session slot poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}

/// Persists the session record as JSON in a single file.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileStore {
    fn get(&self) -> Result<Option<Session>, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                // A record we cannot read is as good as none; drop it.
                warn!("discarding unreadable session file {:?}: {}", self.path, e);
                self.clear()?;
                Ok(None)
            }
        }
    }

    fn set(&self, session: &Session) -> Result<(), Error> {
        trace!("persisting session to {:?}", self.path);
        let bytes = serde_json::to_vec(session)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn session() -> Session {
        Session {
            session_id: "s-1".into(),
            bearer_token: "bearer".into(),
            expires_at: Utc::now() + Duration::minutes(15),
            election_id: "e-1".into(),
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ballotbox-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn memory_store_round_trip_and_clear() {
        let store = MemoryStore::new();
        assert!(store.get().unwrap().is_none());
        store.set(&session()).unwrap();
        assert_eq!(store.get().unwrap().unwrap().session_id, "s-1");
        store.clear().unwrap();
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn file_store_survives_a_new_handle() {
        let path = temp_path("reload");
        FileStore::new(&path).set(&session()).unwrap();
        let reloaded = FileStore::new(&path).get().unwrap().unwrap();
        assert_eq!(reloaded.bearer_token, "bearer");
        FileStore::new(&path).clear().unwrap();
        assert!(!path.exists());
        // clearing twice is fine
        FileStore::new(&path).clear().unwrap();
    }

    #[test]
    fn corrupt_file_reads_as_empty_and_is_removed() {
        let path = temp_path("corrupt");
        fs::write(&path, b"{not json").unwrap();
        let store = FileStore::new(&path);
        assert!(store.get().unwrap().is_none());
        assert!(!path.exists());
    }
}
