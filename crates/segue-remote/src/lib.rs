//! # segue-remote
//!
//! Remote execution for segue units: a framed bincode protocol, the client
//! [`RemoteLink`] with its fault event channel, the [`RemoteUnit`] that
//! stands in for an instance running elsewhere, and the [`NodeServer`] that
//! hosts factories on the far side.
//!
//! The link is blocking at its surface - the session controller calls into it
//! synchronously and the tokio runtime stays an implementation detail.
//! Faults never arrive as callbacks: they land on a bounded channel the
//! session drains on its own thread.

pub mod error;
pub mod link;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod unit;

pub use error::{FaultKind, NodeErrorCode, RemoteError, RemoteFault, Result};
pub use link::{RemoteFactoryHandle, RemoteLink};
pub use protocol::{AudioPacket, NodeReply, NodeRequest, StreamParams, DEFAULT_COMPRESSION, DEFAULT_LATENCY_MS};
pub use server::NodeServer;
pub use unit::RemoteUnit;
