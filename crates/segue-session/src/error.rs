//! The update-protocol error taxonomy.

use thiserror::Error;

/// Terminal outcomes of one `update_session` attempt.
///
/// Every variant is recoverable at the session level: the unit that was
/// current before the attempt is still current and audible after it.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Compile or instantiation failed (locally, or node-side with an intact
    /// factory).
    #[error("Impossible to create a DSP instance: {0}")]
    InstanceCreation(String),

    /// The new control surface could not be allocated.
    #[error("Impossible to allocate new interface: {0}")]
    InterfaceAllocation(String),

    /// The node evicted its factory and the one recompile-and-reupload
    /// recovery cycle failed too.
    #[error("Remote factory could not be rebuilt: {0}")]
    RemoteFactoryUnrecoverable(String),

    /// Transport fault talking to the node; not retried.
    #[error("Remote connection lost: {0}")]
    RemoteConnectionLost(String),

    /// The audio stream could not be (re)initialized for the new unit.
    #[error("Audio device could not be initialized: {0}")]
    DeviceInit(String),

    /// A second update was requested while one was in flight.
    #[error("An update is already in progress for this window")]
    UpdateInProgress,
}

pub type Result<T> = std::result::Result<T, UpdateError>;
