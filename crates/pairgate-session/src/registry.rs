//! In-memory registry of live sessions
//!
//! Structural changes (insert/remove) go through one `RwLock`; a session's
//! own state has its own mutex, so polling one session never blocks on
//! events for another.

use crate::session::{Session, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session {0} is already registered")]
    Duplicate(SessionId),
}

/// Map of session ID to session record
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session; IDs must be unique among registered sessions
    pub fn insert(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        if sessions.contains_key(&session.id) {
            return Err(RegistryError::Duplicate(session.id));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.read().get(id).cloned()
    }

    /// Remove a session
    ///
    /// Of several concurrent callers exactly one gets `Some`.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.write().remove(id)
    }

    /// IDs of sessions strictly older than `max_age` at `now`
    pub fn older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        self.read()
            .values()
            .filter(|s| s.is_older_than(max_age, now))
            .map(|s| s.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
