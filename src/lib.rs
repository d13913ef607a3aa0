//! portmap - gateway I/O layer and request orchestration for LAN port mapping
//!
//! This library provides the asynchronous plumbing that port mapping protocols
//! (PCP, NAT-PMP, UPnP) are built on:
//! - A message bus used for all cross-component communication
//! - A UDP gateway serving many logical sockets from one worker
//! - A TCP gateway for per-request outbound connections
//! - A process gateway streaming external process I/O
//! - An orchestrator that turns retried sends into correlated responses

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod codec;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod presets;
pub mod probe;

/// Result type alias for portmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for portmap operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The receiving side of a bus has shut down
    #[error("Bus closed: {0}")]
    BusClosed(String),

    /// No reply arrived before the deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// A gateway refused or failed a request
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging for portmap
///
/// Honors `RUST_LOG`; defaults to `info` when it is unset.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests;
