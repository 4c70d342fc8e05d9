//! In-process handshake provider
//!
//! Stands in for the messaging network in tests and in `--simulate` mode.
//! Each started handshake is recorded as a [`SimulatedLink`] that can be
//! driven by hand, or completes on its own in auto mode.

use crate::handshake::{
    CloseReason, HandshakeError, HandshakeEvents, HandshakeHandle, HandshakeProvider,
    HandshakeResult, Pairing,
};
use crate::session::PairingCode;
use crate::storage::CredentialDir;
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Characters used for generated pairing codes (no look-alikes)
const CODE_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";

/// E.164 allows at most 15 digits; shorter than 7 is never a mobile number
const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

struct LinkInner {
    phone_number: String,
    dir: PathBuf,
    events: Arc<dyn HandshakeEvents>,
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
}

/// One simulated handshake
#[derive(Clone)]
pub struct SimulatedLink {
    inner: Arc<LinkInner>,
}

impl SimulatedLink {
    pub fn phone_number(&self) -> &str {
        &self.inner.phone_number
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// How many times `stop` was called on this link's handle
    pub fn stop_calls(&self) -> usize {
        self.inner.stop_calls.load(Ordering::SeqCst)
    }

    pub fn issue_scannable_code(&self, payload: impl Into<String>) {
        if !self.is_stopped() {
            self.inner.events.on_scannable_code(payload.into());
        }
    }

    pub fn open(&self) {
        if !self.is_stopped() {
            self.inner.events.on_opened();
        }
    }

    pub fn close(&self, reason: CloseReason) {
        if !self.is_stopped() {
            self.inner.events.on_closed(reason);
        }
    }

    /// Persist `credentials` as the credential artifact, then report `opened`
    pub async fn complete(&self, credentials: &[u8]) -> std::io::Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let path = self.inner.dir.join(pairgate_core::protocol::CREDENTIALS_FILENAME);
        tokio::fs::write(path, credentials).await?;
        self.open();
        Ok(())
    }
}

struct SimulatedHandle {
    link: SimulatedLink,
}

impl HandshakeHandle for SimulatedHandle {
    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.link.inner.stop_calls.fetch_add(1, Ordering::SeqCst);
            if !self.link.inner.stopped.swap(true, Ordering::SeqCst) {
                debug!("Simulated handshake stopped");
            }
        })
    }
}

/// Handshake provider that never leaves the process
///
/// Links are tracked weakly: a link lives as long as its handle (or a caller
/// holding a [`SimulatedLink`]) does, so torn-down sessions are not retained.
#[derive(Default)]
pub struct SimulatedProvider {
    links: Mutex<Vec<Weak<LinkInner>>>,
    auto_complete: Option<Duration>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a scannable code and then complete every handshake on its own,
    /// `delay` after it started
    pub fn with_auto_complete(mut self, delay: Duration) -> Self {
        self.auto_complete = Some(delay);
        self
    }

    /// Links whose handshake is still referenced
    pub fn links(&self) -> Vec<SimulatedLink> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.retain(|link| link.strong_count() > 0);
        links
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| SimulatedLink { inner })
            .collect()
    }

    /// The link whose credential directory is named `session_id`
    pub fn link_for_session(&self, session_id: &str) -> Option<SimulatedLink> {
        self.links()
            .into_iter()
            .find(|l| l.inner.dir.file_name().and_then(|n| n.to_str()) == Some(session_id))
    }

    fn generate_code() -> PairingCode {
        let mut rng = rand::thread_rng();
        let code: String = (0..8)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        PairingCode::new(code)
    }

    fn spawn_auto_complete(link: SimulatedLink, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay / 2).await;
            link.issue_scannable_code(format!("sim:{}", link.phone_number()));
            tokio::time::sleep(delay / 2).await;

            let creds = json!({
                "simulated": true,
                "me": { "id": link.phone_number() },
                "registered": true,
            });
            if let Err(e) = link.complete(creds.to_string().as_bytes()).await {
                debug!("Simulated handshake could not persist credentials: {}", e);
            }
        });
    }
}

impl HandshakeProvider for SimulatedProvider {
    fn start<'a>(
        &'a self,
        phone_number: &'a str,
        dir: &'a CredentialDir,
        events: Arc<dyn HandshakeEvents>,
    ) -> BoxFuture<'a, HandshakeResult<Pairing>> {
        Box::pin(async move {
            if !(MIN_DIGITS..=MAX_DIGITS).contains(&phone_number.len())
                || !phone_number.chars().all(|c| c.is_ascii_digit())
            {
                return Err(HandshakeError::InvalidPhoneNumber(phone_number.to_string()));
            }

            let link = SimulatedLink {
                inner: Arc::new(LinkInner {
                    phone_number: phone_number.to_string(),
                    dir: dir.path().to_path_buf(),
                    events,
                    stopped: AtomicBool::new(false),
                    stop_calls: AtomicUsize::new(0),
                }),
            };
            {
                let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
                links.retain(|link| link.strong_count() > 0);
                links.push(Arc::downgrade(&link.inner));
            }

            if let Some(delay) = self.auto_complete {
                Self::spawn_auto_complete(link.clone(), delay);
            }

            let code = Self::generate_code();
            info!(session_id = %dir.session_id(), "Simulated handshake issued pairing code");
            Ok(Pairing {
                handle: Box::new(SimulatedHandle { link }),
                code,
            })
        })
    }
}
