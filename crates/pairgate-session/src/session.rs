//! Session identity and per-session state
//!
//! A [`Session`] is registered once its handshake has issued a pairing code.
//! Everything that changes afterwards (status, scannable code, the handshake
//! handle) lives in a [`SessionState`] behind a per-session mutex, shared with
//! the event sink the handshake provider reports into.

use crate::handshake::HandshakeHandle;
use chrono::{DateTime, Utc};
use pairgate_core::SessionStatus;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a session, also the name of its credential directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-enterable code issued by the handshake provider
///
/// Stored without separators; eight-character codes display as `XXXX-XXXX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let code = raw
            .as_ref()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self(code)
    }

    /// The code without separators
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() == 8 {
            write!(f, "{}-{}", &self.0[..4], &self.0[4..])
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Strip everything but digits from a phone number
///
/// Returns `None` when nothing is left.
pub fn normalize_phone_number(input: &str) -> Option<String> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Mutable part of a session
pub struct SessionState {
    status: SessionStatus,
    scannable_code: Option<String>,
    handle: Option<Box<dyn HandshakeHandle>>,
    /// Set by teardown; events arriving afterwards are dropped
    detached: bool,
}

pub type SharedState = Arc<Mutex<SessionState>>;

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Connecting,
            scannable_code: None,
            handle: None,
            detached: false,
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn scannable_code(&self) -> Option<&str> {
        self.scannable_code.as_deref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Store the live handshake handle; a session owns at most one
    pub(crate) fn attach_handle(&mut self, handle: Box<dyn HandshakeHandle>) {
        debug_assert!(self.handle.is_none(), "session already owns a handshake");
        self.handle = Some(handle);
    }

    /// Stop accepting events and hand out the handshake handle for stopping
    pub(crate) fn detach(&mut self) -> Option<Box<dyn HandshakeHandle>> {
        self.detached = true;
        self.handle.take()
    }

    /// Replace the scannable code while the handshake is still running
    pub(crate) fn set_scannable_code(&mut self, payload: String) -> bool {
        if self.detached || self.status.is_terminal() {
            return false;
        }
        self.scannable_code = Some(payload);
        true
    }

    pub(crate) fn mark_connected(&mut self) -> bool {
        self.finish(SessionStatus::Connected)
    }

    pub(crate) fn mark_failed(&mut self) -> bool {
        self.finish(SessionStatus::Failed)
    }

    /// One-way latch into a terminal status
    fn finish(&mut self, status: SessionStatus) -> bool {
        if self.detached || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("status", &self.status)
            .field("scannable_code", &self.scannable_code.is_some())
            .field("handle", &self.handle.is_some())
            .field("detached", &self.detached)
            .finish()
    }
}

/// Lock a session state, recovering the data if a holder panicked
pub(crate) fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered pairing session
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Digits-only phone number handed to the provider
    pub phone_number: String,
    pub pairing_code: PairingCode,
    pub created_at: DateTime<Utc>,
    state: SharedState,
}

impl Session {
    /// `created_at` is when the session ID was issued, before the handshake
    /// started
    pub fn new(
        id: SessionId,
        phone_number: String,
        pairing_code: PairingCode,
        created_at: DateTime<Utc>,
        state: SharedState,
    ) -> Self {
        Self {
            id,
            phone_number,
            pairing_code,
            created_at,
            state,
        }
    }

    /// Lock this session's mutable state
    ///
    /// The guard must not be held across an `.await`.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        lock_state(&self.state)
    }

    #[cfg(test)]
    pub(crate) fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// Copy of the current state for pollers
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            id: self.id,
            status: state.status,
            scannable_code: state.scannable_code.clone(),
            pairing_code: self.pairing_code.to_string(),
            created_at: self.created_at,
        }
    }

    /// Whether the session is strictly older than `max_age` at `now`
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.created_at).to_std() {
            Ok(age) => age > max_age,
            // created_at lies in the future
            Err(_) => false,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub scannable_code: Option<String>,
    pub pairing_code: String,
    pub created_at: DateTime<Utc>,
}
