//! Error types for dns-monitor.

use thiserror::Error;

/// Errors that can occur in the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Name resolution failed or produced no addresses
    #[error("Could not lookup name: '{name}': {reason}")]
    Resolve {
        /// Name that was looked up.
        name: String,
        /// Resolver error text.
        reason: String,
    },

    /// A TXT discovery entry is not of the form `<name>, <base>`
    #[error("Invalid TXT entry: '{0}'")]
    InvalidTxtSpec(String),

    /// WebSocket transport or handshake error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed status frame
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The aggregator control loop is no longer running
    #[error("status aggregator has shut down")]
    HubClosed,

    /// HTTP listener failure
    #[error("HTTP server error: {0}")]
    Http(String),
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        MonitorError::Config(err.to_string())
    }
}
