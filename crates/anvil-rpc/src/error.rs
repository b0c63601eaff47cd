//! Engine error types

use anvil_protocol::RemoteError;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection carrying the call went away before a response arrived,
    /// or the engine was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer's handler failed; the record is reconstructed from the wire.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A proxy was invoked before any method name was appended to it.
    #[error("Proxy has no method path")]
    NoMethodPath,

    /// The encoded request exceeds the connection's frame limit and was
    /// never sent.
    #[error("Request exceeds the {max} byte frame limit")]
    FrameTooLarge { max: usize },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// A blocking call was issued from the I/O thread, which would never be
    /// able to deliver its own response.
    #[error("Blocking call issued from the I/O thread")]
    BlockingOnIoThread,

    #[error("Engine is already serving on another thread")]
    AlreadyServing,

    #[error("Unable to connect after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Connect error: {0}")]
    Connect(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// The wire record, when the failure came from the peer.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Failures that end the engine rather than a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. } | Self::Connect(_) | Self::Config(_)
        )
    }
}
