//! # Segue - live-coding DSP host
//!
//! Segue takes a DSP program, compiles it into a running audio unit, hosts
//! that unit on a real-time stream with generated controls, and hot-swaps
//! the running unit without dropout when the program changes. Units can run
//! in-process or on a remote processing node; when the remote link fails the
//! session falls back to local processing on its own.
//!
//! ## Architecture
//!
//! Umbrella crate coordinating:
//! - **segue-core** - engine kernel: unit traits, factory cache, crossfade
//!   render state, CPAL output
//! - **segue-remote** - remote link: framed protocol, fault event channel,
//!   node server
//! - **segue-session** - window sessions, the update protocol, control
//!   surfaces, snapshots, remote fallback
//!
//! ## Quick start
//!
//! ```ignore
//! use segue::prelude::*;
//!
//! let ctx = SessionContext::new(Arc::new(BuiltinCompiler::new()), home_dir)?;
//! let mut engine = AudioEngine::new(EngineConfig::default())?;
//! engine.start()?;
//!
//! let (events, _ui_rx) = crossbeam_channel::unbounded();
//! let mut controller = SessionController::open(
//!     ctx,
//!     "window-1",
//!     UnitDefinition::local("tone", "sine 440"),
//!     engine.handle(),
//!     events,
//! )?;
//!
//! // Live edit: crossfades to the new program, rolls back on failure.
//! controller.update_session(UnitDefinition::local("tone", "sine 220"))?;
//! ```

/// Re-export of segue-core for direct access
pub use segue_core as core;
/// Re-export of segue-remote for direct access
pub use segue_remote as remote;
/// Re-export of segue-session for direct access
pub use segue_session as session;

pub use segue_core::{
    AtomicFlag, AtomicFloat, AudioEngine, BuiltinCompiler, ChannelCount, DspSource, EngineConfig,
    EngineHandle, ExecutionTarget, FactoryCache, FadeRamp, ParamSpec, ProcessingUnit,
    UnitCompiler, UnitDefinition, UnitFactory,
};

pub use segue_remote::{
    FaultKind, NodeErrorCode, NodeServer, RemoteError, RemoteFactoryHandle, RemoteFault,
    RemoteLink, StreamParams,
};

pub use segue_session::{
    ControlSurfaceSet, FaultAction, FaultDebounce, OscControlEndpoint, ParamSnapshot,
    RoutingSnapshot, SessionContext, SessionController, SessionEvent, SessionStatus,
    SnapshotStore, UpdateError, UpdatePhase, WindowSession, FAULT_DEBOUNCE,
};

/// Everything a host application typically needs.
pub mod prelude {
    pub use crate::{
        AudioEngine, BuiltinCompiler, EngineConfig, EngineHandle, ExecutionTarget,
        ProcessingUnit, SessionContext, SessionController, SessionEvent, UnitCompiler,
        UnitDefinition, UpdateError,
    };
    pub use std::sync::Arc;
}
