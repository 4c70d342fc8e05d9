//! Boundary to the external device-linking handshake
//!
//! A [`HandshakeProvider`] starts one handshake per session and reports its
//! progress through the [`HandshakeEvents`] it was handed. The returned
//! [`HandshakeHandle`] is the only way to terminate it.

use crate::session::PairingCode;
use crate::storage::CredentialDir;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors while initiating a handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),
    #[error("Handshake helper I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake helper exited before issuing a pairing code")]
    Exited,
    #[error("No pairing code issued within {0:?}")]
    Timeout(Duration),
    #[error("Handshake rejected: {0}")]
    Rejected(String),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Why the provider's connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account logged the linked device out
    LoggedOut,
    /// The network refused the link
    Forbidden,
    /// Stored session material is unusable
    BadSession,
    ConnectionLost,
    ConnectionClosed,
    RestartRequired,
    TimedOut,
    Other(String),
}

impl CloseReason {
    /// Authoritative closes end the session; anything else is retried by the
    /// provider
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            CloseReason::LoggedOut | CloseReason::Forbidden | CloseReason::BadSession
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::LoggedOut => "logged_out",
            CloseReason::Forbidden => "forbidden",
            CloseReason::BadSession => "bad_session",
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::ConnectionClosed => "connection_closed",
            CloseReason::RestartRequired => "restart_required",
            CloseReason::TimedOut => "timed_out",
            CloseReason::Other(reason) => reason,
        }
    }
}

impl std::str::FromStr for CloseReason {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Ok(match normalized.as_str() {
            "logged_out" | "loggedout" | "logout" => Self::LoggedOut,
            "forbidden" | "rejected" => Self::Forbidden,
            "bad_session" | "badsession" => Self::BadSession,
            "connection_lost" | "connectionlost" => Self::ConnectionLost,
            "" | "connection_closed" | "connectionclosed" => Self::ConnectionClosed,
            "restart_required" | "restartrequired" => Self::RestartRequired,
            "timed_out" | "timedout" | "timeout" => Self::TimedOut,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks a running handshake reports into
///
/// Called from the provider's own tasks, concurrently with everything else.
pub trait HandshakeEvents: Send + Sync {
    /// A new scannable code was issued (may rotate several times)
    fn on_scannable_code(&self, payload: String);

    /// The link completed and credentials were persisted
    fn on_opened(&self);

    /// The connection closed
    fn on_closed(&self, reason: CloseReason);
}

/// Owned handle to one running handshake
pub trait HandshakeHandle: Send {
    /// Terminate the handshake and stop delivering events
    ///
    /// Calling this more than once is a no-op.
    fn stop(&mut self) -> BoxFuture<'_, ()>;
}

/// A started handshake
pub struct Pairing {
    pub handle: Box<dyn HandshakeHandle>,
    pub code: PairingCode,
}

impl std::fmt::Debug for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pairing").field("code", &self.code).finish()
    }
}

/// Starts handshakes against the messaging network
pub trait HandshakeProvider: Send + Sync {
    /// Start linking `phone_number` (digits only), persisting credentials
    /// into `dir`, and wait for the pairing code
    fn start<'a>(
        &'a self,
        phone_number: &'a str,
        dir: &'a CredentialDir,
        events: Arc<dyn HandshakeEvents>,
    ) -> BoxFuture<'a, HandshakeResult<Pairing>>;
}
