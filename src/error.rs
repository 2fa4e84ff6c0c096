//! Error types for the session engine.
//!
//! Transport errors end a session and are handed to the reconnection
//! scheduler; parse errors only ever cause a single line to be skipped.

use thiserror::Error;

/// Failures while opening or running a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// I/O error on the socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// TCP connect (or TLS handshake) did not finish in time.
    #[error("connection to {addr} timed out after {secs}s")]
    Timeout { addr: String, secs: u64 },

    /// Host name is not usable for TLS SNI.
    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    /// TLS handshake failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The session configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The backend task is gone.
    #[error("engine is shut down")]
    Closed,
}

/// Reasons a raw line could not be parsed into a [`Message`](crate::message::Message).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("message tags are not followed by a space")]
    UnterminatedTags,

    #[error("prefix is not followed by a space")]
    UnterminatedPrefix,

    #[error("no command found")]
    MissingCommand,
}

/// Errors loading or saving a profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed profile: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine a configuration directory")]
    NoConfigDir,

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
