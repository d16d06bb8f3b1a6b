//! Error types for the offline-shell library.

use thiserror::Error;

use crate::worker::WorkerState;

/// Errors that can occur while installing, activating or serving requests.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error (connection refused, DNS failure, timeout...).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from the on-disk cache storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The network could not produce a response.
    #[error("Network failure: {0}")]
    Network(String),

    /// A response arrived but its status is not in the 2xx range.
    #[error("Unexpected status {status} for {url}")]
    BadStatus {
        /// URL that was requested.
        url: String,
        /// Status code that came back.
        status: u16,
    },

    /// A cache storage operation failed.
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A URL could not be parsed or resolved.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The worker was asked to move between incompatible lifecycle states.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState {
        /// State the worker was in.
        from: WorkerState,
        /// State that was requested.
        to: WorkerState,
    },

    /// `respond_with` was called more than once for the same fetch event.
    #[error("respond_with already called for this fetch event")]
    AlreadyResponded,
}

/// A specialized `Result` type for offline-shell operations.
pub type Result<T> = std::result::Result<T, Error>;
