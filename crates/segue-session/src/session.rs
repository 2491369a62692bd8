//! Window sessions: one visible unit-of-work binding a definition, its live
//! unit, its controls and its audio stream.

use crate::fault::FaultDebounce;
use crate::netctl::OscControlEndpoint;
use crate::surface::ControlSurfaceSet;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use segue_core::{ChannelCount, EngineHandle, UnitDefinition, UnitFactory};
use segue_remote::{RemoteFactoryHandle, RemoteFault, RemoteLink};
use std::sync::Arc;
use std::time::Instant;

/// Notifications a session emits toward the UI thread.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UpdateCommitted {
        window: String,
        program: String,
    },
    UpdateFailed {
        window: String,
        error: String,
    },
    /// Remote connection error; the session is switching back to local
    /// processing.
    RemoteFallback {
        window: String,
        detail: String,
    },
    EngineFault {
        window: String,
        detail: String,
    },
}

/// The compiled artifact a session's current unit came from.
///
/// Tagged once at construction; no call site branches on locality afterwards.
pub enum FactorySlot {
    Local(Arc<dyn UnitFactory>),
    Remote {
        link: Arc<RemoteLink>,
        handle: RemoteFactoryHandle,
        instance_id: u64,
    },
}

impl FactorySlot {
    /// Release node-side resources. Local factories just drop.
    pub(crate) fn release(self) {
        if let FactorySlot::Remote {
            link, instance_id, ..
        } = self
        {
            if let Err(err) = link.drop_instance(instance_id) {
                tracing::debug!(error = %err, "node-side instance release failed");
            }
        }
    }
}

/// Lock-free view of what a window is currently running, for UI readers.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub window: String,
    pub program: String,
    pub target: String,
    pub channels: Option<ChannelCount>,
}

/// One window's bindings. Mutated only by its controller.
pub struct WindowSession {
    pub(crate) name: String,
    pub(crate) definition: Arc<UnitDefinition>,
    pub(crate) slot: Option<FactorySlot>,
    pub(crate) engine: EngineHandle,
    pub(crate) surface: ControlSurfaceSet,
    pub(crate) netctl: Option<OscControlEndpoint>,
    pub(crate) channels: Option<ChannelCount>,
    pub(crate) debounce: FaultDebounce,
    pub(crate) faults: Option<Receiver<RemoteFault>>,
    pub(crate) events: Sender<SessionEvent>,
    status: ArcSwap<SessionStatus>,
}

impl WindowSession {
    pub(crate) fn new(
        name: String,
        definition: Arc<UnitDefinition>,
        engine: EngineHandle,
        events: Sender<SessionEvent>,
    ) -> Self {
        let status = SessionStatus {
            window: name.clone(),
            program: definition.name().to_string(),
            target: definition.target().to_string(),
            channels: None,
        };
        Self {
            name,
            definition,
            slot: None,
            engine,
            surface: ControlSurfaceSet::empty(),
            netctl: None,
            channels: None,
            debounce: FaultDebounce::new(Instant::now()),
            faults: None,
            events,
            status: ArcSwap::from_pointee(status),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &Arc<UnitDefinition> {
        &self.definition
    }

    pub fn surface(&self) -> &ControlSurfaceSet {
        &self.surface
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Channel geometry of the current unit, `None` in the no-DSP state.
    pub fn channels(&self) -> Option<ChannelCount> {
        self.channels
    }

    /// Port of this window's OSC control endpoint, when one is configured.
    pub fn osc_port(&self) -> Option<u16> {
        self.netctl.as_ref().map(|endpoint| endpoint.port())
    }

    /// Single atomic read of what this window is running.
    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.load_full()
    }

    pub(crate) fn publish_status(&self) {
        self.status.store(Arc::new(SessionStatus {
            window: self.name.clone(),
            program: self.definition.name().to_string(),
            target: self.definition.target().to_string(),
            channels: self.channels,
        }));
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
