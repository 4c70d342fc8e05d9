//! Configuration types for Pairgate

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the directory created under the platform data dir
const APP_DIR: &str = "pairgate";

/// Main configuration for Pairgate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind: IpAddr,
    /// Server port
    pub port: u16,
    /// Root directory holding one credential directory per session
    pub storage_root: PathBuf,
    /// Seconds between two expiry sweeps
    pub sweep_interval_secs: u64,
    /// Sessions older than this many seconds are torn down by the sweep
    pub max_session_age_secs: u64,
    /// Seconds to keep a session alive after its credentials were downloaded
    pub download_grace_secs: u64,
    /// Length of the rate-limit window in seconds
    pub rate_limit_window_secs: u64,
    /// Session creations allowed per client within one window
    pub rate_limit_max_requests: u32,
    /// Seconds to wait for the handshake helper to issue a pairing code
    pub pairing_code_timeout_secs: u64,
    /// External handshake helper program (None = simulated provider)
    pub handshake_command: Option<String>,
    /// Extra arguments passed to the handshake helper
    pub handshake_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            storage_root: Self::default_storage_root(),
            sweep_interval_secs: 60,
            max_session_age_secs: 600,
            download_grace_secs: 5,
            rate_limit_window_secs: 60,
            rate_limit_max_requests: 5,
            pairing_code_timeout_secs: 30,
            handshake_command: None,
            handshake_args: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Default storage root (`<data dir>/pairgate/sessions`), falling back to
    /// the system temp directory when no data dir is known
    pub fn default_storage_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
            .join("sessions")
    }

    /// Builder pattern: set bind address
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set storage root
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Builder pattern: set maximum session age
    pub fn with_max_session_age_secs(mut self, secs: u64) -> Self {
        self.max_session_age_secs = secs;
        self
    }

    /// Builder pattern: set post-download grace delay
    pub fn with_download_grace_secs(mut self, secs: u64) -> Self {
        self.download_grace_secs = secs;
        self
    }

    /// Builder pattern: set rate limit window and request cap
    pub fn with_rate_limit(mut self, window_secs: u64, max_requests: u32) -> Self {
        self.rate_limit_window_secs = window_secs;
        self.rate_limit_max_requests = max_requests;
        self
    }

    /// Builder pattern: set pairing code timeout
    pub fn with_pairing_code_timeout_secs(mut self, secs: u64) -> Self {
        self.pairing_code_timeout_secs = secs;
        self
    }

    /// Builder pattern: set the external handshake helper
    pub fn with_handshake_command(mut self, command: Option<String>, args: Vec<String>) -> Self {
        self.handshake_command = command;
        self.handshake_args = args;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn download_grace(&self) -> Duration {
        Duration::from_secs(self.download_grace_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn pairing_code_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_code_timeout_secs)
    }

    /// Reject values that would make the service unusable
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep interval must be at least 1 second".into()));
        }
        if self.max_session_age_secs == 0 {
            return Err(Error::Config("maximum session age must be at least 1 second".into()));
        }
        if self.rate_limit_window_secs == 0 || self.rate_limit_max_requests == 0 {
            return Err(Error::Config(
                "rate limit window and request cap must be non-zero".into(),
            ));
        }
        if self.pairing_code_timeout_secs == 0 {
            return Err(Error::Config("pairing code timeout must be at least 1 second".into()));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::Config("storage root must not be empty".into()));
        }
        if matches!(&self.handshake_command, Some(cmd) if cmd.trim().is_empty()) {
            return Err(Error::Config("handshake command must not be blank".into()));
        }
        Ok(())
    }
}
