//! Shared application state

use crate::rate_limit::RateLimiter;
use pairgate_core::Config;
use pairgate_session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Owner of every live pairing session
    pub sessions: SessionManager,
    /// Limits session creation per client address
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, sessions: SessionManager) -> Self {
        let rate_limiter =
            RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window());
        Self {
            config,
            sessions,
            rate_limiter,
        }
    }

    /// Periodically forget clients that went quiet
    pub fn spawn_rate_limit_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let period = state.rate_limiter.window().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                state.rate_limiter.gc();
                trace!(
                    clients = state.rate_limiter.tracked_clients(),
                    "Rate limiter collected"
                );
            }
        })
    }
}
