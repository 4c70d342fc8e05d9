//! Pairgate Server - Axum-based HTTP API
//!
//! This crate exposes pairing sessions over HTTP: creation, status polling,
//! scannable code retrieval and credential download.

pub mod http;
pub mod rate_limit;
pub mod state;

pub use http::create_router;
pub use rate_limit::RateLimiter;
pub use state::AppState;
