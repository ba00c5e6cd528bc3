//! Error types for the speed test engine

use thiserror::Error;

/// Failure of a single HTTP exchange. Never escapes a measurement phase.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Failure of a whole run, as opposed to a run that measured zero.
#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("speed test cancelled")]
    Cancelled,

    #[error("speed test task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
