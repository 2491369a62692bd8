//! Error types for segue-core.

use thiserror::Error;

/// Error type for engine-kernel operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Failed to enumerate devices")]
    DevicesError(#[from] cpal::DevicesError),

    #[error("Failed to get device name")]
    DeviceNameError(#[from] cpal::DeviceNameError),

    #[error("Compilation failed: {0}")]
    Compile(String),

    #[error("Instantiation failed: {0}")]
    Instantiate(String),

    #[error("Unit wants {requested} output channels, stream carries {available}")]
    ChannelConfig { requested: usize, available: usize },

    #[error("Engine is already processing a handoff")]
    EngineBusy,

    #[error("Crossfade did not complete within {0:?}")]
    FadeTimeout(core::time::Duration),

    #[error("Render side is gone")]
    RenderDetached,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Compile(err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
