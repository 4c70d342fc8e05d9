//! Pairgate - Device-linking pairing service
//!
//! Starts a linking handshake for a phone number, hands out the pairing code,
//! and lets the caller download the resulting credential bundle once the phone
//! has approved the link.

use anyhow::{bail, Context, Result};
use clap::Parser;
use pairgate_core::Config;
use pairgate_server::{create_router, AppState};
use pairgate_session::{
    CredentialStore, HandshakeProvider, LifecycleConfig, ProcessProvider, SessionManager,
    SimulatedProvider,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Pairgate - Link a messaging account and download its credentials
#[derive(Parser, Debug)]
#[command(name = "pairgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags and environment override its values
    #[arg(short, long, env = "PAIRGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "PAIRGATE_BIND")]
    bind: Option<IpAddr>,

    /// Server port
    #[arg(short, long, env = "PAIRGATE_PORT")]
    port: Option<u16>,

    /// Directory holding one credential directory per session
    #[arg(short, long, env = "PAIRGATE_STORAGE")]
    storage: Option<PathBuf>,

    /// Seconds after which unfinished sessions are removed
    #[arg(long, env = "PAIRGATE_MAX_SESSION_AGE")]
    max_session_age: Option<u64>,

    /// Seconds between expiry sweeps
    #[arg(long, env = "PAIRGATE_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Seconds between a credential download and session teardown
    #[arg(long, env = "PAIRGATE_DOWNLOAD_GRACE")]
    download_grace: Option<u64>,

    /// Rate limit window for session creation, in seconds
    #[arg(long, env = "PAIRGATE_RATE_LIMIT_WINDOW")]
    rate_limit_window: Option<u64>,

    /// Session creations allowed per client within the window
    #[arg(long, env = "PAIRGATE_RATE_LIMIT_MAX")]
    rate_limit_max: Option<u32>,

    /// Seconds to wait for the helper to issue a pairing code
    #[arg(long, env = "PAIRGATE_PAIRING_CODE_TIMEOUT")]
    pairing_code_timeout: Option<u64>,

    /// Handshake helper program speaking the line protocol on stdout
    #[arg(long, env = "PAIRGATE_HELPER", conflicts_with = "simulate")]
    helper: Option<String>,

    /// Extra argument for the helper (repeatable)
    #[arg(long = "helper-arg", allow_hyphen_values = true)]
    helper_args: Vec<String>,

    /// Use the in-process simulated network instead of a helper
    /// Every handshake completes on its own after --simulate-delay seconds
    #[arg(long, env = "PAIRGATE_SIMULATE")]
    simulate: bool,

    /// Seconds until a simulated handshake completes
    #[arg(long, default_value = "5")]
    simulate_delay: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Layer flags and environment over the file (or default) configuration
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::new(),
        };

        if let Some(bind) = self.bind {
            config = config.with_bind(bind);
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(storage) = &self.storage {
            config = config.with_storage_root(storage);
        }
        if let Some(secs) = self.max_session_age {
            config = config.with_max_session_age_secs(secs);
        }
        if let Some(secs) = self.sweep_interval {
            config = config.with_sweep_interval_secs(secs);
        }
        if let Some(secs) = self.download_grace {
            config = config.with_download_grace_secs(secs);
        }
        if self.rate_limit_window.is_some() || self.rate_limit_max.is_some() {
            let window = self.rate_limit_window.unwrap_or(config.rate_limit_window_secs);
            let max = self.rate_limit_max.unwrap_or(config.rate_limit_max_requests);
            config = config.with_rate_limit(window, max);
        }
        if let Some(secs) = self.pairing_code_timeout {
            config = config.with_pairing_code_timeout_secs(secs);
        }
        if self.helper.is_some() {
            config = config.with_handshake_command(self.helper.clone(), self.helper_args.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn build_provider(args: &Args, config: &Config) -> Result<Arc<dyn HandshakeProvider>> {
    if args.simulate {
        warn!("Simulated handshakes: no real account will be linked");
        let provider = SimulatedProvider::new()
            .with_auto_complete(Duration::from_secs(args.simulate_delay.max(1)));
        return Ok(Arc::new(provider));
    }

    match &config.handshake_command {
        Some(program) => {
            info!("Handshake helper: {}", program);
            let provider = ProcessProvider::new(program.clone(), config.handshake_args.clone())
                .with_code_timeout(config.pairing_code_timeout());
            Ok(Arc::new(provider))
        }
        None => bail!("No handshake provider configured: pass --helper <program> or --simulate"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("Pairgate v{}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config()?;
    let provider = build_provider(&args, &config)?;

    info!("Credential storage: {}", config.storage_root.display());
    let store = Arc::new(
        CredentialStore::open(&config.storage_root)
            .await
            .context("Failed to initialize credential storage")?,
    );
    match store.purge_stale().await {
        Ok(0) => {}
        Ok(count) => info!("Removed {} credential directories left by a previous run", count),
        Err(e) => warn!("Failed to purge stale credential directories: {}", e),
    }

    let sessions = SessionManager::new(store, provider, LifecycleConfig::from(&config));
    let sweeper = sessions.spawn_sweeper();
    info!(
        "Sessions expire after {}s (sweep every {}s)",
        config.max_session_age_secs, config.sweep_interval_secs
    );

    let addr = SocketAddr::new(config.bind, config.port);
    let state = Arc::new(AppState::new(config, sessions.clone()));
    let rate_limit_gc = state.spawn_rate_limit_gc();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Press Ctrl+C to stop.");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    rate_limit_gc.abort();
    sweeper.stop().await;
    sessions.shutdown().await;

    info!("Pairgate stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pairgate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_partial_rate_limit_override_keeps_other_value() {
        let config = parse(&["--rate-limit-max", "9"]).load_config().unwrap();
        assert_eq!(config.rate_limit_max_requests, 9);
        assert_eq!(config.rate_limit_window_secs, Config::default().rate_limit_window_secs);

        let config = parse(&["--rate-limit-window", "30"]).load_config().unwrap();
        assert_eq!(config.rate_limit_window_secs, 30);
        assert_eq!(config.rate_limit_max_requests, Config::default().rate_limit_max_requests);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&["--port", "9090", "--max-session-age", "120", "--helper", "link-helper"])
            .load_config()
            .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_session_age_secs, 120);
        assert_eq!(config.handshake_command.as_deref(), Some("link-helper"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["--rate-limit-max", "0"]).load_config().is_err());
    }
}
