//! Session lifecycle: creation, status, download and teardown
//!
//! Flow:
//! 1. `create_session` allocates a credential directory, starts a handshake
//!    and registers the session once a pairing code was issued
//! 2. The handshake reports into a per-session [`SessionSink`]
//! 3. Pollers read state through `get_status` / `get_scannable_code`
//! 4. A successful `download_credentials` schedules teardown after a grace delay
//! 5. The [`Sweeper`] tears down sessions older than the maximum age
//!
//! Teardown removes the registry entry first; whichever caller wins that removal
//! detaches the event sink, stops the handshake and deletes the credential
//! directory. Every other caller is a no-op.

use crate::handshake::{CloseReason, HandshakeError, HandshakeEvents, HandshakeProvider};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{
    lock_state, normalize_phone_number, PairingCode, Session, SessionId, SessionSnapshot,
    SessionState, SharedState,
};
use crate::storage::{CredentialStore, StorageError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pairgate_core::{Config, SessionStatus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Failed to start handshake: {0}")]
    HandshakeInit(#[from] HandshakeError),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {0} is not connected")]
    NotReady(String),
    #[error("No scannable code issued yet for session {0}")]
    NotAvailable(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Timing knobs of the lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Sessions older than this are torn down by the sweep
    pub max_age: Duration,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
    /// Delay between a successful download and teardown
    pub download_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            download_grace: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for LifecycleConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_age: config.max_session_age(),
            sweep_interval: config.sweep_interval(),
            download_grace: config.download_grace(),
        }
    }
}

/// Result of a successful `create_session`
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub pairing_code: PairingCode,
}

/// Receives handshake events for one session
///
/// Holds the session's state directly so events issued before the session is
/// registered are not lost. Once teardown detached the state, events are
/// dropped.
struct SessionSink {
    session_id: SessionId,
    state: SharedState,
}

impl HandshakeEvents for SessionSink {
    fn on_scannable_code(&self, payload: String) {
        let mut state = lock_state(&self.state);
        if state.set_scannable_code(payload) {
            debug!(session_id = %self.session_id, "Scannable code updated");
        } else {
            debug!(session_id = %self.session_id, status = %state.status(), "Ignoring scannable code");
        }
    }

    fn on_opened(&self) {
        let mut state = lock_state(&self.state);
        if state.mark_connected() {
            info!(session_id = %self.session_id, "Session connected");
        }
    }

    fn on_closed(&self, reason: CloseReason) {
        let mut state = lock_state(&self.state);
        if !reason.is_authoritative() {
            debug!(session_id = %self.session_id, %reason, "Connection closed, provider will retry");
            return;
        }
        if state.mark_failed() {
            warn!(session_id = %self.session_id, %reason, "Session failed");
        }
    }
}

/// Owns every live session and its resources
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    store: Arc<CredentialStore>,
    provider: Arc<dyn HandshakeProvider>,
    config: LifecycleConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn HandshakeProvider>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            store,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Number of registered sessions
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    fn lookup(&self, id: &str) -> SessionResult<Arc<Session>> {
        SessionId::parse(id)
            .ok()
            .and_then(|id| self.registry.get(&id))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Start pairing `phone_number`
    pub async fn create_session(&self, phone_number: &str) -> SessionResult<CreatedSession> {
        if phone_number.trim().is_empty() {
            return Err(SessionError::Validation("phone number is required".into()));
        }
        let digits = normalize_phone_number(phone_number).ok_or_else(|| {
            SessionError::Validation("phone number must contain digits".into())
        })?;

        let id = SessionId::new();
        let created_at = Utc::now();
        let dir = self.store.allocate(&id).await?;
        let state = SessionState::shared();
        let sink = Arc::new(SessionSink {
            session_id: id,
            state: state.clone(),
        });

        let pairing = match self.provider.start(&digits, &dir, sink).await {
            Ok(pairing) => pairing,
            Err(e) => {
                warn!(session_id = %id, "Handshake failed to start: {}", e);
                self.destroy_storage(&id).await;
                return Err(e.into());
            }
        };

        lock_state(&state).attach_handle(pairing.handle);
        let session = Arc::new(Session::new(
            id,
            digits,
            pairing.code.clone(),
            created_at,
            state,
        ));

        if let Err(e) = self.registry.insert(session.clone()) {
            let handle = session.state().detach();
            if let Some(mut handle) = handle {
                handle.stop().await;
            }
            self.destroy_storage(&id).await;
            return Err(e.into());
        }

        info!(session_id = %id, "Session created");
        Ok(CreatedSession {
            session_id: id,
            pairing_code: pairing.code,
        })
    }

    /// Current status and scannable code of a session
    pub fn get_status(&self, id: &str) -> SessionResult<SessionSnapshot> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Latest scannable code of a session
    pub fn get_scannable_code(&self, id: &str) -> SessionResult<String> {
        let session = self.lookup(id)?;
        let code = session.state().scannable_code().map(str::to_string);
        code.ok_or_else(|| SessionError::NotAvailable(id.to_string()))
    }

    /// Read the credential artifact of a connected session
    ///
    /// On success the session is torn down after the grace delay.
    pub async fn download_credentials(&self, id: &str) -> SessionResult<Bytes> {
        let session = self.lookup(id)?;
        let status = session.state().status();
        if status != SessionStatus::Connected {
            return Err(SessionError::NotReady(id.to_string()));
        }

        let data = match self.store.read_credentials(&session.id).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Err(SessionError::NotReady(id.to_string())),
            Err(e) => return Err(e.into()),
        };

        info!(session_id = %session.id, bytes = data.len(), "Credentials downloaded");
        self.schedule_teardown(session.id);
        Ok(data)
    }

    /// Explicitly end a session
    pub async fn cancel(&self, id: &str) -> SessionResult<()> {
        let session = self.lookup(id)?;
        self.teardown(&session.id).await;
        Ok(())
    }

    fn schedule_teardown(&self, id: SessionId) {
        let manager = self.clone();
        let grace = self.config.download_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.teardown(&id).await;
        });
    }

    /// Release everything a session holds
    ///
    /// Returns `true` for the one call that actually tore the session down;
    /// later or concurrent calls return `false`.
    pub async fn teardown(&self, id: &SessionId) -> bool {
        let Some(session) = self.registry.remove(id) else {
            debug!(session_id = %id, "Session already torn down");
            return false;
        };

        let (handle, status) = {
            let mut state = session.state();
            (state.detach(), state.status())
        };
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
        self.destroy_storage(id).await;

        info!(session_id = %id, %status, "Session torn down");
        true
    }

    /// Best-effort removal of a session's credential directory
    async fn destroy_storage(&self, id: &SessionId) {
        if let Err(e) = self.store.destroy(id).await {
            warn!(session_id = %id, "Failed to remove credential directory: {}", e);
        }
    }

    /// Tear down every session older than the maximum age
    pub async fn sweep_expired(&self) -> Vec<SessionId> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Like [`sweep_expired`](Self::sweep_expired), measuring age at `now`
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut removed = Vec::new();
        for id in self.registry.older_than(self.config.max_age, now) {
            if self.teardown(&id).await {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Expired sessions swept");
        }
        removed
    }

    /// Run the expiry sweep periodically until the returned handle is stopped
    pub fn spawn_sweeper(&self) -> Sweeper {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let manager = self.clone();
        let period = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        });

        Sweeper {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Tear down all sessions; used on process shutdown
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }
        info!("Tearing down {} remaining sessions", ids.len());
        let teardowns = ids.iter().map(|id| self.teardown(id));
        futures::future::join_all(teardowns).await;
    }
}

/// Handle to the periodic expiry sweep
///
/// Dropping it aborts the sweep; [`Sweeper::stop`] lets a running sweep finish.
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("Expiry sweeper ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}
