//! Error types for the remote processing link.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes a processing node reports over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeErrorCode {
    /// The node no longer holds the compiled factory (evicted server-side).
    FactoryNotFound,
    /// The factory exists but instantiation failed.
    InstanceNotCreated,
    /// The audio return stream could not be attached.
    TransportNotStarted,
    /// The node refused or dropped the connection.
    ConnectionFailed,
}

impl NodeErrorCode {
    /// User-visible description.
    pub fn message(&self) -> &'static str {
        match self {
            NodeErrorCode::FactoryNotFound => "impossible to create remote factory",
            NodeErrorCode::InstanceNotCreated => "impossible to create DSP instance",
            NodeErrorCode::TransportNotStarted => "return stream not started",
            NodeErrorCode::ConnectionFailed => "connection to processing node failed",
        }
    }
}

impl std::fmt::Display for NodeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors from the remote link.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Node error: {0}")]
    Node(NodeErrorCode),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Link is closed")]
    LinkClosed,

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl RemoteError {
    /// True for the server-side-eviction code that triggers the
    /// recompile-and-reupload recovery; every other failure is a transport
    /// fault from the caller's perspective.
    pub fn is_factory_not_found(&self) -> bool {
        matches!(self, RemoteError::Node(NodeErrorCode::FactoryNotFound))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Direction of a transport fault observed while an instance is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

/// A transport fault delivered asynchronously on the link's fault channel.
#[derive(Debug, Clone)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub detail: String,
}
