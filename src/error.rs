//! Error types for the engine bridge.
//!
//! `BridgeError` is what every public `Session` operation returns. The
//! variants map one-to-one onto the failure classes a caller has to tell
//! apart: the engine never came up, it came up but the two sides stopped
//! agreeing on the protocol, or the engine ran the request and reported a
//! failure of its own.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::ipc::TransportError;
use crate::proxy::DescriptorError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Errors surfaced by a [`Session`](crate::Session) and the handles it hands out.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine subprocess could not be spawned.
    #[error("Failed to start engine `{command}`: {source}")]
    Startup {
        /// Rendered command line, for diagnostics.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine did not answer the handshake in time.
    #[error("Engine did not answer the handshake within {}s", .0.as_secs_f32())]
    ConnectTimeout(Duration),

    /// `stop()` was called while the engine was still starting.
    #[error("Engine startup was cancelled by stop()")]
    StartCancelled,

    /// A call was made while the session is not connected.
    #[error("Session is not started")]
    NotStarted,

    /// The response could not be decoded; client and engine disagree on the wire format.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// The engine executed the request and reported a failure.
    #[error("Remote error {identifier}: {message}")]
    RemoteExecution {
        /// Engine error identifier, e.g. `MATLAB:dimagree`. May be empty.
        identifier: String,
        /// Engine diagnostic text, verbatim.
        message: String,
    },

    /// The referenced remote function or variable does not exist.
    #[error("Undefined remote name: {name}")]
    UndefinedName {
        /// Name that failed to resolve.
        name: String,
    },

    /// I/O failure on an established connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A proxy or bound function outlived the session that produced it.
    #[error("Session has been dropped")]
    SessionClosed,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the error says the remote name does not exist.
    pub fn is_undefined(&self) -> bool {
        matches!(self, BridgeError::UndefinedName { .. })
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::ProtocolDesync(err.to_string())
    }
}

impl From<DescriptorError> for BridgeError {
    fn from(err: DescriptorError) -> Self {
        BridgeError::ProtocolDesync(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::ProtocolDesync(format!("Invalid JSON: {}", err))
    }
}
