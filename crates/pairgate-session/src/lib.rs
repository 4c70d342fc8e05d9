//! Pairgate Session - Pairing session lifecycle
//!
//! Creates pairing sessions against an external handshake provider, tracks
//! their progress for concurrent pollers and reclaims every resource a session
//! holds (handshake, credential directory, registry entry) however it ends.
//!
//! # Session Flow
//!
//! 1. `SessionManager::create_session()` allocates a credential directory and
//!    starts a handshake, returning the pairing code
//! 2. The user enters the code (or scans the scannable code) on their phone
//! 3. The provider reports `opened`; the session becomes `connected`
//! 4. `SessionManager::download_credentials()` returns `creds.json` and
//!    schedules teardown
//! 5. Sessions that never finish are removed by the expiry sweep
//!
//! # Example
//!
//! ```no_run
//! use pairgate_session::{CredentialStore, LifecycleConfig, SessionManager, SimulatedProvider};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(CredentialStore::open("/tmp/pairgate").await.unwrap());
//!     let provider = Arc::new(SimulatedProvider::new());
//!     let manager = SessionManager::new(store, provider, LifecycleConfig::default());
//!     let _sweeper = manager.spawn_sweeper();
//!
//!     let created = manager.create_session("+1 555 123 4567").await.unwrap();
//!     println!("Enter code on phone: {}", created.pairing_code);
//!
//!     let status = manager.get_status(&created.session_id.to_string()).unwrap();
//!     println!("Status: {}", status.status);
//! }
//! ```

pub mod handshake;
pub mod manager;
pub mod process;
pub mod registry;
pub mod session;
pub mod simulated;
pub mod storage;

pub use handshake::{
    CloseReason, HandshakeError, HandshakeEvents, HandshakeHandle, HandshakeProvider,
    HandshakeResult, Pairing,
};
pub use manager::{
    CreatedSession, LifecycleConfig, SessionError, SessionManager, SessionResult, Sweeper,
};
pub use process::ProcessProvider;
pub use registry::{RegistryError, SessionRegistry};
pub use session::{PairingCode, Session, SessionId, SessionSnapshot};
pub use simulated::{SimulatedLink, SimulatedProvider};
pub use storage::{CredentialDir, CredentialStore, StorageError, StorageResult};
