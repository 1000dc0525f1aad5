//! Error types for the call multiplexer.
//!
//! Configuration errors (missing or duplicate ports) surface synchronously to
//! whoever creates a binding. Executor failures either travel in-band inside an
//! [`Envelope`](crate::envelope::Envelope) or stall a direct binding.

use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Which side of the port table a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Inbound call source.
    Source,
    /// Outbound result sink.
    Sink,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Source => write!(f, "call port"),
            PortKind::Sink => write!(f, "return port"),
        }
    }
}

/// Main error type for the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    // Configuration errors
    #[error("Missing {kind}: {name}")]
    MissingPort { kind: PortKind, name: String },

    #[error("Duplicate {kind}: {name}")]
    DuplicatePort { kind: PortKind, name: String },

    #[error("Call port already subscribed: {name}")]
    PortAlreadySubscribed { name: String },

    // Sequencing errors
    #[error("Completion for sequence {seq} arrived after release of everything below {next_release}")]
    StaleCompletion { seq: u64, next_release: u64 },

    #[error("Sequence {seq} completed twice")]
    DuplicateCompletion { seq: u64 },

    #[error("Sequence {seq} was never admitted (next admit id is {next_admit})")]
    UnadmittedCompletion { seq: u64, next_admit: u64 },

    // Executor errors
    #[error("Executor call {operation} failed: {message}")]
    Executor { operation: String, message: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Connection to executor at {addr} lost")]
    ConnectionLost { addr: SocketAddr },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{what} closed")]
    Closed { what: String },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        MuxError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(err: serde_json::Error) -> Self {
        MuxError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MuxError {
    /// Shorthand for a missing-port configuration error.
    pub fn missing(kind: PortKind, name: impl Into<String>) -> Self {
        MuxError::MissingPort {
            kind,
            name: name.into(),
        }
    }

    /// True for errors raised while wiring ports, before any call is processed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MuxError::MissingPort { .. }
                | MuxError::DuplicatePort { .. }
                | MuxError::PortAlreadySubscribed { .. }
        )
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    /// - -32000: Connectivity error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            MuxError::Remote { code, .. } => *code,
            MuxError::Json { .. } => -32700,
            MuxError::Validation { .. } => -32602,
            MuxError::ConnectionLost { .. } | MuxError::Timeout(_) | MuxError::Io { .. } => -32000,
            _ => -32603,
        }
    }
}
