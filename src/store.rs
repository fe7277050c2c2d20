//! Durable session persistence.
//!
//! The session is written as ONE JSON record under one key, so a reader can
//! never observe a new access token next to a stale user profile. Backends
//! only have to make single-key writes atomic.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::Error;
use crate::transport::CallbackParams;
use crate::types::{Session, UserProfile};

const SESSION_KEY: &str = "session";
const PENDING_KEY: &str = "pending_sign_in";
const CALLBACK_KEY: &str = "pending_callback";

/// Key/value persistence that survives restarts (the platform's local storage).
///
/// `set` must replace the value for a key atomically; `remove` of a missing
/// key is not an error.
pub trait StorageBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Process-lifetime storage, for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// target, so a crash mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let target = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The persisted session record.
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    #[serde(flatten)]
    session: Session,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
}

/// Redirect sign-in state kept across the provider round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSignIn {
    pub state: String,
    pub nonce: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl PendingSignIn {
    #[must_use]
    pub fn new(state: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            nonce: nonce.into(),
            started_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Sole owner of the current session.
///
/// Constructed once and shared as `Arc<SessionStore>` with the gateway and
/// the orchestrator; there is no global instance.
pub struct SessionStore {
    backend: Box<dyn StorageBackend>,
    // Serializes writers against readers of the backend.
    lock: RwLock<()>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(backend: impl StorageBackend) -> Self {
        Self {
            backend: Box::new(backend),
            lock: RwLock::new(()),
        }
    }

    /// A store backed by [`MemoryStorage`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    /// Replace the persisted session wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the record cannot be written; the
    /// previous session is then left in place.
    pub fn save(&self, session: &Session) -> Result<(), Error> {
        let record = SessionRecord {
            session: session.clone(),
            saved_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| Error::Storage(std::io::Error::other(e)))?;

        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.backend.set(SESSION_KEY, &json)?;
        debug!("Session saved");
        Ok(())
    }

    /// Remove the persisted session.
    ///
    /// Idempotent. Returns `true` only for the call that actually removed a
    /// session, even when several callers race.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backend fails to remove the record.
    pub fn clear(&self) -> Result<bool, Error> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let present = self.read_session().is_some();
        self.backend.remove(SESSION_KEY)?;
        if present {
            debug!("Session cleared");
        }
        Ok(present)
    }

    /// The present session, or `None`.
    ///
    /// Unreadable or corrupt records read as `None`.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.read_session()
    }

    /// `true` iff a session with a non-empty access token is present.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    /// Cached profile of the signed-in user.
    #[must_use]
    pub fn current_user(&self) -> Option<UserProfile> {
        self.current().and_then(|s| s.user)
    }

    /// Persist redirect state before navigating away to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the record cannot be written.
    pub fn stash_pending(&self, pending: &PendingSignIn) -> Result<(), Error> {
        let json = serde_json::to_string(pending)
            .map_err(|e| Error::Storage(std::io::Error::other(e)))?;
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.backend.set(PENDING_KEY, &json)
    }

    /// Take (and remove) the pending redirect state, if any.
    #[must_use]
    pub fn take_pending(&self) -> Option<PendingSignIn> {
        self.take_record(PENDING_KEY, "pending sign-in")
    }

    /// Hold the provider's callback parameters for the entry route, so they
    /// never travel in a URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the parameters cannot be persisted.
    pub fn stash_callback(&self, params: &CallbackParams) -> Result<(), Error> {
        let json = serde_json::to_string(params)
            .map_err(|e| Error::Storage(std::io::Error::other(e)))?;
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.backend.set(CALLBACK_KEY, &json)
    }

    /// Take (and remove) stashed callback parameters, if any.
    #[must_use]
    pub fn take_callback(&self) -> Option<CallbackParams> {
        self.take_record(CALLBACK_KEY, "callback")
    }

    fn take_record<T: DeserializeOwned>(&self, key: &str, what: &str) -> Option<T> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let raw = self.read_raw(key)?;
        if let Err(e) = self.backend.remove(key) {
            warn!(error = %e, key, "Failed to remove {what} record");
        }
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, key, "Discarding unreadable {what} record");
                None
            }
        }
    }

    fn read_session(&self) -> Option<Session> {
        let raw = self.read_raw(SESSION_KEY)?;
        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => Some(record.session),
            Err(e) => {
                warn!(error = %e, "Persisted session is unreadable; treating as signed out");
                None
            }
        }
    }

    fn read_raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, key, "Storage read failed");
                None
            }
        }
    }
}
