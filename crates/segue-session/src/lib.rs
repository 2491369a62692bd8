//! # segue-session
//!
//! Session management for segue: the window sessions that bind a definition
//! to a live unit, the controller that migrates them glitch-free between
//! programs (and between local and remote execution), generated control
//! surfaces, persisted per-window snapshots, and the debounced
//! fallback-to-local path for remote transport faults.
//!
//! The controller runs synchronously on the control thread and blocks for
//! compilation, network round trips and crossfade completion. Per window at
//! most one update is in flight; a second request is rejected with
//! [`UpdateError::UpdateInProgress`].

pub mod context;
pub mod controller;
pub mod error;
pub mod fault;
pub mod netctl;
pub mod session;
pub mod snapshot;
pub mod surface;

pub use context::SessionContext;
pub use controller::{SessionController, UpdatePhase};
pub use error::{Result, UpdateError};
pub use fault::{FaultAction, FaultDebounce, FAULT_DEBOUNCE};
pub use netctl::OscControlEndpoint;
pub use session::{FactorySlot, SessionEvent, SessionStatus, WindowSession};
pub use snapshot::{ParamSnapshot, RouteConnection, RoutingSnapshot, SnapshotStore, StoreError};
pub use surface::{Control, ControlSurfaceSet, SurfaceError};
