//! Filesystem storage for per-session credentials
//!
//! Layout: `<root>/<session id>/creds.json`, plus whatever else the handshake
//! provider decides to persist next to it. The store only ever creates, reads
//! and removes these directories; their content belongs to the provider.

use crate::session::SessionId;
use bytes::Bytes;
use pairgate_core::protocol::CREDENTIALS_FILENAME;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Credential directory already exists: {0:?}")]
    AlreadyExists(PathBuf),
    #[error("No credentials persisted for session {0}")]
    NotFound(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A session's allocated credential directory
#[derive(Debug, Clone)]
pub struct CredentialDir {
    session_id: SessionId,
    path: PathBuf,
}

impl CredentialDir {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the provider is expected to write the credential artifact
    pub fn credentials_path(&self) -> PathBuf {
        self.path.join(CREDENTIALS_FILENAME)
    }
}

/// Credential store rooted at one directory
#[derive(Debug)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Open the store, creating the root directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!("Credential store rooted at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a session, whether or not it exists
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create an empty directory for a new session
    pub async fn allocate(&self, id: &SessionId) -> StorageResult<CredentialDir> {
        let path = self.session_dir(id);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                debug!(session_id = %id, "Allocated credential directory");
                Ok(CredentialDir {
                    session_id: *id,
                    path,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the credential artifact written by the handshake provider
    pub async fn read_credentials(&self, id: &SessionId) -> StorageResult<Bytes> {
        let path = self.session_dir(id).join(CREDENTIALS_FILENAME);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively remove a session's directory; absent is not an error
    pub async fn destroy(&self, id: &SessionId) -> StorageResult<()> {
        match tokio::fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => {
                debug!(session_id = %id, "Removed credential directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove session directories left behind by a previous process
    ///
    /// Only directories named like a session ID are touched.
    pub async fn purge_stale(&self) -> StorageResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_session = name
                .to_str()
                .map(|n| Uuid::parse_str(n).is_ok())
                .unwrap_or(false);
            if !is_session || !entry.file_type().await?.is_dir() {
                continue;
            }

            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale session directory {:?}: {}", entry.path(), e),
            }
        }

        if removed > 0 {
            info!("Removed {} stale session directories", removed);
        }
        Ok(removed)
    }
}
