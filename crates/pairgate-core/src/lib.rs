//! Pairgate Core - Shared configuration and wire types
//!
//! This crate provides the foundational types used across all Pairgate components.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::SessionStatus;
