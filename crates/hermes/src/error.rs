use std::path::PathBuf;
use thiserror::Error;

/// Which list of the relay descriptor a validation failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// The `services` list.
    Service,
    /// The `communicators` list.
    Communicator,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::Communicator => f.write_str("communicator"),
        }
    }
}

/// Errors raised while loading, validating or watching the relay descriptor.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The descriptor file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The descriptor is not well-formed JSON of the expected shape.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// A service or communicator name is empty, duplicated or unusable.
    #[error("invalid {kind} name {name:?}: {reason}")]
    Validation {
        /// List the offending entry belongs to.
        kind: EntityKind,
        /// The offending name.
        name: String,
        /// Human readable reason.
        reason: &'static str,
    },
    /// The descriptor file was removed while the relay was running.
    #[error("configuration file {} was removed", .0.display())]
    ConfigurationLost(PathBuf),
    /// The file watcher could not be set up.
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
    /// Loading the token record during startup failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors reading or writing the token record.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// I/O failure on the token record.
    #[error("token record {}: {source}", .path.display())]
    Io {
        /// Path of the record (or its temporary sibling).
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// A non-blank line without a `=` separator.
    #[error("token record line {line}: missing '=' separator")]
    Malformed {
        /// One-based line number.
        line: usize,
    },
}

/// Errors surfaced by the relay's network endpoints.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The presented token is unknown or belongs to the wrong role.
    #[error("invalid token")]
    Unauthorized,
    /// The client did not present a token before the deadline.
    #[error("authentication timed out")]
    AuthTimeout,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
    /// Envelope serialization failed.
    #[error("envelope encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscriber has no address for a communicator's `id-index`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("recipient {recipient:?} has {len} ids, communicator {communicator:?} needs index {index}")]
pub struct AddressRangeFault {
    /// Recipient with the short id list.
    pub recipient: String,
    /// Communicator whose index is out of range.
    pub communicator: String,
    /// The communicator's `id-index`.
    pub index: usize,
    /// Length of the recipient's `ids`.
    pub len: usize,
}
