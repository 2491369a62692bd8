//! The session controller: the hot-swap update protocol.
//!
//! `update_session` runs the full migration on the control thread:
//! save point, instantiate (local compile or remote request with the
//! one-shot factory recovery), bind the new control surface, crossfade on
//! the engine, then commit. Every failure path rolls back to the unit that
//! was current when the call started; the audio callback never observes a
//! half-migrated window.

use crate::context::SessionContext;
use crate::error::{Result, UpdateError};
use crate::fault::FaultAction;
use crate::netctl::OscControlEndpoint;
use crate::session::{FactorySlot, SessionEvent, WindowSession};
use crate::snapshot::{RouteConnection, RoutingSnapshot};
use crate::surface::ControlSurfaceSet;
use crossbeam_channel::Sender;
use segue_core::{
    ChannelCount, EngineHandle, ExecutionTarget, ProcessingUnit, SilenceUnit, UnitDefinition,
};
use segue_remote::{NodeErrorCode, RemoteError, RemoteFault, RemoteLink};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Protocol phases of one in-flight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Instantiating,
    Binding,
    CrossFading,
    Committing,
    RollingBack,
}

/// Transient record of one migration. Exists only for the duration of a
/// single `update_session` call; never persisted.
struct MigrationState {
    phase: UpdatePhase,
}

impl MigrationState {
    fn new() -> Self {
        Self {
            phase: UpdatePhase::Idle,
        }
    }

    fn enter(&mut self, window: &str, phase: UpdatePhase) {
        tracing::debug!(window, from = ?self.phase, to = ?phase, "migration phase");
        self.phase = phase;
    }
}

/// What instantiation produced, before the engine has seen any of it.
struct PendingUnit {
    unit: Box<dyn ProcessingUnit>,
    slot: FactorySlot,
    faults: Option<crossbeam_channel::Receiver<RemoteFault>>,
}

impl PendingUnit {
    /// Abandon the pending unit, releasing its node-side half if remote.
    fn discard(self) {
        drop(self.unit);
        self.slot.release();
    }
}

/// Ports scanned upward from the context's OSC base per window.
const OSC_PORT_SPAN: u16 = 32;

/// Orchestrates one window's session against the shared context.
pub struct SessionController {
    ctx: Arc<SessionContext>,
    window: WindowSession,
    fade_duration: Duration,
    in_flight: bool,
}

impl SessionController {
    /// Open a window: instantiate the definition, bind its controls, recall
    /// saved parameters and make the unit current (no crossfade on first
    /// install). Fails without leaving anything running.
    pub fn open(
        ctx: Arc<SessionContext>,
        name: impl Into<String>,
        definition: Arc<UnitDefinition>,
        engine: EngineHandle,
        events: Sender<SessionEvent>,
    ) -> Result<Self> {
        let name = name.into();
        let window = WindowSession::new(name.clone(), definition.clone(), engine, events);
        let mut controller = Self {
            ctx,
            window,
            fade_duration: Duration::from_millis(200),
            in_flight: false,
        };

        let pending = controller.instantiate(&definition)?;
        let surface = match ControlSurfaceSet::build(pending.unit.as_ref()) {
            Ok(surface) => surface,
            Err(err) => {
                pending.discard();
                return Err(UpdateError::InterfaceAllocation(err.to_string()));
            }
        };
        controller.recall_params(&surface);
        let netctl = match controller.bind_netctl(&surface) {
            Ok(netctl) => netctl,
            Err(err) => {
                pending.discard();
                return Err(err);
            }
        };

        let channels = ChannelCount::of(pending.unit.as_ref());
        let PendingUnit { unit, slot, faults } = pending;
        if let Err(err) = controller.window.engine.install(unit) {
            slot.release();
            return Err(engine_error(err));
        }

        controller.window.slot = Some(slot);
        controller.window.surface = surface;
        controller.window.netctl = netctl;
        controller.window.faults = faults;
        controller.window.channels = Some(channels);
        controller.window.publish_status();

        tracing::info!(window = %controller.window.name, program = definition.name(), "window opened");
        Ok(controller)
    }

    pub fn window(&self) -> &WindowSession {
        &self.window
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn fade_duration(&self) -> Duration {
        self.fade_duration
    }

    pub fn set_fade_duration(&mut self, duration: Duration) {
        self.fade_duration = duration;
    }

    /// Swap this window's processing to `new_definition` through the full
    /// migration protocol. On failure the previously current unit is still
    /// current; on success the old unit has been retired and released.
    pub fn update_session(&mut self, new_definition: Arc<UnitDefinition>) -> Result<()> {
        if self.in_flight {
            return Err(UpdateError::UpdateInProgress);
        }
        self.in_flight = true;
        let result = self.run_update(new_definition);
        self.in_flight = false;

        self.window.debounce.note_migration(Instant::now());
        match &result {
            Ok(()) => self.window.emit(SessionEvent::UpdateCommitted {
                window: self.window.name.clone(),
                program: self.window.definition.name().to_string(),
            }),
            Err(err) => {
                tracing::warn!(window = %self.window.name, error = %err, "update failed");
                self.window.emit(SessionEvent::UpdateFailed {
                    window: self.window.name.clone(),
                    error: err.to_string(),
                });
            }
        }
        result
    }

    fn run_update(&mut self, new_definition: Arc<UnitDefinition>) -> Result<()> {
        let mut migration = MigrationState::new();
        let window_name = self.window.name.clone();

        // Save point: current state persists before anything mutates.
        self.save_window();

        migration.enter(&window_name, UpdatePhase::Instantiating);
        let pending = match self.instantiate(&new_definition) {
            Ok(pending) => pending,
            Err(err) => {
                migration.enter(&window_name, UpdatePhase::RollingBack);
                return Err(err);
            }
        };

        migration.enter(&window_name, UpdatePhase::Binding);
        let surface = match ControlSurfaceSet::build(pending.unit.as_ref()) {
            Ok(surface) => surface,
            Err(err) => {
                // Pending unit is discarded; the old surface was never torn
                // down, so the window stays fully bound to the old unit.
                migration.enter(&window_name, UpdatePhase::RollingBack);
                pending.discard();
                return Err(UpdateError::InterfaceAllocation(err.to_string()));
            }
        };
        self.recall_params(&surface);
        // The old endpoint gives up its port first; on failure the rollback
        // rebuilds it against the still-current surface.
        let netctl = match self.bind_netctl(&surface) {
            Ok(netctl) => netctl,
            Err(err) => {
                migration.enter(&window_name, UpdatePhase::RollingBack);
                pending.discard();
                return Err(err);
            }
        };

        migration.enter(&window_name, UpdatePhase::CrossFading);
        let channels = ChannelCount::of(pending.unit.as_ref());
        let PendingUnit {
            unit,
            slot: new_slot,
            faults: new_faults,
        } = pending;
        if let Err(err) = self.window.engine.begin_fade(unit, self.fade_duration) {
            migration.enter(&window_name, UpdatePhase::RollingBack);
            new_slot.release();
            drop(netctl);
            self.restore_netctl();
            return Err(engine_error(err));
        }
        let retired = match self.window.engine.wait_fade_end(self.fade_wait()) {
            Ok(retired) => retired,
            Err(err) => {
                migration.enter(&window_name, UpdatePhase::RollingBack);
                new_slot.release();
                drop(netctl);
                self.restore_netctl();
                return Err(engine_error(err));
            }
        };

        migration.enter(&window_name, UpdatePhase::Committing);
        let old_slot = self.window.slot.replace(new_slot);
        self.window.definition = new_definition;
        self.window.surface = surface;
        self.window.netctl = netctl;
        self.window.faults = new_faults;
        self.window.channels = Some(channels);
        self.window.publish_status();

        // Old unit and old factory reference are released on this thread,
        // never the audio thread.
        drop(retired);
        if let Some(slot) = old_slot {
            slot.release();
        }

        migration.enter(&window_name, UpdatePhase::Idle);
        tracing::info!(window = %window_name, program = self.window.definition.name(), "update committed");
        Ok(())
    }

    /// Create a new unit for `definition`, local or remote.
    fn instantiate(&self, definition: &Arc<UnitDefinition>) -> Result<PendingUnit> {
        let sample_rate = self.window.engine.sample_rate();
        let block_size = self.window.engine.block_frames();

        match definition.target() {
            ExecutionTarget::Local => {
                let factory = self
                    .ctx
                    .local_factory(definition)
                    .map_err(|err| UpdateError::InstanceCreation(err.to_string()))?;
                let unit = factory
                    .instantiate(sample_rate, block_size)
                    .map_err(|err| UpdateError::InstanceCreation(err.to_string()))?;
                Ok(PendingUnit {
                    unit,
                    slot: FactorySlot::Local(factory),
                    faults: None,
                })
            }
            ExecutionTarget::Remote { host, port } => {
                let link = self
                    .ctx
                    .link_to(host, *port)
                    .map_err(|err| UpdateError::RemoteConnectionLost(err.to_string()))?;
                self.instantiate_remote(&link, definition, sample_rate, block_size)
            }
        }
    }

    fn instantiate_remote(
        &self,
        link: &Arc<RemoteLink>,
        definition: &Arc<UnitDefinition>,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<PendingUnit> {
        let handle = self
            .ctx
            .remote_factory(link, definition)
            .map_err(remote_upload_error)?;

        match link.create_instance(&handle, self.ctx.stream_params(), sample_rate, block_size) {
            Ok(unit) => Ok(Self::remote_pending(link, handle, unit)),
            Err(err) if err.is_factory_not_found() => {
                // The node evicted its compiled artifact. Recompile, reupload
                // and retry exactly once; a second failure is terminal for
                // this attempt.
                tracing::warn!(
                    window = %self.window.name,
                    program = definition.name(),
                    "remote factory evicted, recompiling"
                );
                self.ctx.invalidate_remote_factory(link, &handle.key);
                let handle = self
                    .ctx
                    .remote_factory(link, definition)
                    .map_err(|err| UpdateError::RemoteFactoryUnrecoverable(err.to_string()))?;
                match link.create_instance(
                    &handle,
                    self.ctx.stream_params(),
                    sample_rate,
                    block_size,
                ) {
                    Ok(unit) => Ok(Self::remote_pending(link, handle, unit)),
                    Err(err) => Err(UpdateError::RemoteFactoryUnrecoverable(err.to_string())),
                }
            }
            Err(err) => Err(remote_instance_error(err)),
        }
    }

    fn remote_pending(
        link: &Arc<RemoteLink>,
        handle: segue_remote::RemoteFactoryHandle,
        unit: segue_remote::RemoteUnit,
    ) -> PendingUnit {
        let instance_id = unit.instance_id();
        let faults = link.faults();
        PendingUnit {
            slot: FactorySlot::Remote {
                link: link.clone(),
                handle,
                instance_id,
            },
            unit: Box::new(unit),
            faults: Some(faults),
        }
    }

    /// Drain pending remote faults, coalescing inside the debounce window.
    /// Outside the window a fault switches this session back to local
    /// processing through the full update protocol. Returns the fallback
    /// result when one ran.
    pub fn pump_faults(&mut self) -> Option<Result<()>> {
        self.pump_faults_at(Instant::now())
    }

    pub fn pump_faults_at(&mut self, now: Instant) -> Option<Result<()>> {
        // Device-level stream errors are surfaced but never trigger the
        // remote fallback; the stream owner decides how to recover.
        while let Ok(detail) = self.window.engine.device_faults().try_recv() {
            tracing::warn!(window = %self.window.name, detail = %detail, "audio stream error");
            self.window.emit(SessionEvent::EngineFault {
                window: self.window.name.clone(),
                detail,
            });
        }

        let receiver = self.window.faults.clone()?;
        let mut fall_back = false;

        while let Ok(fault) = receiver.try_recv() {
            tracing::debug!(
                window = %self.window.name,
                kind = ?fault.kind,
                detail = %fault.detail,
                "remote fault"
            );
            if self.window.debounce.observe(now) == FaultAction::FallBack {
                fall_back = true;
            }
        }

        if !fall_back {
            return None;
        }

        tracing::warn!(
            window = %self.window.name,
            "remote connection error, switching back to local processing"
        );
        self.window.emit(SessionEvent::RemoteFallback {
            window: self.window.name.clone(),
            detail: "remote connection error, switching back to local processing".into(),
        });

        let local = self.window.definition.with_target(ExecutionTarget::Local);
        Some(self.update_session(local))
    }

    /// Persist the window's parameter and routing snapshots. Failures are
    /// logged, not fatal - a save must never block a migration.
    pub fn save_window(&self) {
        let store = self.ctx.store();
        if let Err(err) = store.save_params(&self.window.name, &self.window.surface.snapshot()) {
            tracing::warn!(window = %self.window.name, error = %err, "parameter save failed");
        }
        if let Err(err) = store.save_routing(&self.window.name, &self.routing_snapshot()) {
            tracing::warn!(window = %self.window.name, error = %err, "routing save failed");
        }
    }

    /// Bind this window's OSC control endpoint against `surface`, releasing
    /// the previous endpoint's port first. No-op when the context has no OSC
    /// base port.
    fn bind_netctl(&mut self, surface: &ControlSurfaceSet) -> Result<Option<OscControlEndpoint>> {
        let Some(base) = self.ctx.osc_port() else {
            return Ok(None);
        };
        self.window.netctl = None;
        match OscControlEndpoint::bind_scan(base, OSC_PORT_SPAN, surface) {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(err) => {
                self.restore_netctl();
                Err(UpdateError::InterfaceAllocation(err.to_string()))
            }
        }
    }

    /// Best-effort rebuild of the endpoint for the still-current surface
    /// after a rolled-back migration.
    fn restore_netctl(&mut self) {
        let Some(base) = self.ctx.osc_port() else {
            return;
        };
        match OscControlEndpoint::bind_scan(base, OSC_PORT_SPAN, &self.window.surface) {
            Ok(endpoint) => self.window.netctl = Some(endpoint),
            Err(err) => {
                tracing::warn!(window = %self.window.name, error = %err, "OSC endpoint rebuild failed");
            }
        }
    }

    fn recall_params(&self, surface: &ControlSurfaceSet) {
        match self.ctx.store().load_params(&self.window.name) {
            Ok(Some(snapshot)) => surface.apply(&snapshot),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(window = %self.window.name, error = %err, "parameter recall failed");
            }
        }
    }

    fn routing_snapshot(&self) -> RoutingSnapshot {
        let connections = match self.window.channels {
            Some(channels) => (0..channels.outputs)
                .map(|ch| RouteConnection {
                    source: format!("{}:out_{}", self.window.name, ch),
                    dest: format!("playback_{}", ch + 1),
                })
                .collect(),
            None => Vec::new(),
        };
        RoutingSnapshot {
            device: None,
            connections,
        }
    }

    fn fade_wait(&self) -> Duration {
        self.fade_duration + Duration::from_secs(5)
    }

    /// Close the window: save state, silence the stream, release the unit
    /// and its factory reference. Consumes the controller, so a close can
    /// only happen once any in-flight update has returned.
    pub fn close(mut self) {
        self.save_window();
        if self.window.engine.install(Box::new(SilenceUnit)).is_ok() {
            self.window.engine.reap_retired();
        }
        if let Some(slot) = self.window.slot.take() {
            slot.release();
        }
        tracing::info!(window = %self.window.name, "window closed");
    }
}

fn engine_error(err: segue_core::Error) -> UpdateError {
    match err {
        segue_core::Error::EngineBusy => UpdateError::UpdateInProgress,
        other => UpdateError::DeviceInit(other.to_string()),
    }
}

/// First upload of a factory failed: a node-side compile problem reads as an
/// instantiation failure, anything else as a lost connection. The
/// unrecoverable code is reserved for the retry path.
fn remote_upload_error(err: RemoteError) -> UpdateError {
    match err {
        RemoteError::Node(code) => UpdateError::InstanceCreation(code.message().to_string()),
        other => UpdateError::RemoteConnectionLost(other.to_string()),
    }
}

fn remote_instance_error(err: RemoteError) -> UpdateError {
    match err {
        RemoteError::Node(NodeErrorCode::InstanceNotCreated) => {
            UpdateError::InstanceCreation(NodeErrorCode::InstanceNotCreated.message().to_string())
        }
        RemoteError::Node(code) => UpdateError::RemoteConnectionLost(code.message().to_string()),
        other => UpdateError::RemoteConnectionLost(other.to_string()),
    }
}
