//! Local persistence for the email address awaiting an email-link sign-in.
//!
//! The value lives under a single key so it survives a reload of the page that
//! handles the link. It is cleared only after the link was consumed successfully.

use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const PENDING_EMAIL_KEY: &str = "emailForSignIn";

#[derive(Debug, Error)]
pub enum PendingEmailError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait PendingEmailStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn load(&self) -> Result<Option<String>, PendingEmailError>;

    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn save(&self, email: &str) -> Result<(), PendingEmailError>;

    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn clear(&self) -> Result<(), PendingEmailError>;
}

/// Keeps the value in process memory. A new instance behaves like another device.
#[derive(Default)]
pub struct MemoryStore {
    email: Mutex<Option<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingEmailStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, PendingEmailError> {
        Ok(self
            .email
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, email: &str) -> Result<(), PendingEmailError> {
        *self.email.lock().unwrap_or_else(PoisonError::into_inner) = Some(email.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), PendingEmailError> {
        *self.email.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// A JSON object on disk, shared with other keys the application may store.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Map<String, Value>, PendingEmailError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, map: &Map<String, Value>) -> Result<(), PendingEmailError> {
        std::fs::write(&self.path, serde_json::to_vec_pretty(map)?)?;
        Ok(())
    }
}

impl PendingEmailStore for FileStore {
    fn load(&self) -> Result<Option<String>, PendingEmailError> {
        Ok(self
            .read()?
            .get(PENDING_EMAIL_KEY)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn save(&self, email: &str) -> Result<(), PendingEmailError> {
        let mut map = self.read()?;
        map.insert(PENDING_EMAIL_KEY.to_string(), Value::from(email));
        self.write(&map)
    }

    fn clear(&self) -> Result<(), PendingEmailError> {
        let mut map = self.read()?;
        if map.remove(PENDING_EMAIL_KEY).is_some() {
            self.write(&map)?;
        }
        Ok(())
    }
}
