//! Remote execution over a loopback node: instance creation, the one-shot
//! factory-eviction recovery, the unrecoverable path, and the debounced
//! fallback to local processing.

mod helpers;

use helpers::{render_until, RenderPump, TestCompiler};
use segue::core::{EngineHandle, RenderState};
use segue::{
    FaultKind, NodeServer, SessionContext, SessionController, SessionEvent, UnitDefinition,
    UpdateError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct RemoteFixture {
    server: NodeServer,
    poison: Arc<AtomicBool>,
    ctx: Arc<SessionContext>,
    _home: tempfile::TempDir,
    events: crossbeam_channel::Receiver<SessionEvent>,
    events_tx: crossbeam_channel::Sender<SessionEvent>,
}

impl RemoteFixture {
    fn new() -> Self {
        let server_compiler = TestCompiler::new();
        let poison = server_compiler.poison_switch();
        let server = NodeServer::bind("127.0.0.1:0", Arc::new(server_compiler)).unwrap();

        let home = tempfile::tempdir().unwrap();
        let ctx = SessionContext::new(Arc::new(TestCompiler::new()), home.path()).unwrap();
        let (events_tx, events) = crossbeam_channel::unbounded();

        Self {
            server,
            poison,
            ctx,
            _home: home,
            events,
            events_tx,
        }
    }

    fn remote_def(&self, name: &str, source: &str) -> Arc<UnitDefinition> {
        UnitDefinition::remote(name, source, "127.0.0.1", self.server.port())
    }

    fn open(
        &self,
        name: &str,
        definition: Arc<UnitDefinition>,
    ) -> (SessionController, RenderPump, Arc<RenderState>) {
        let (state, handle) = EngineHandle::detached(48_000.0, 2, 128);
        let pump = RenderPump::start(state.clone());
        let mut controller = SessionController::open(
            self.ctx.clone(),
            name,
            definition,
            handle,
            self.events_tx.clone(),
        )
        .unwrap();
        controller.set_fade_duration(Duration::from_millis(5));
        (controller, pump, state)
    }

    fn fallback_events(&self) -> usize {
        self.events
            .try_iter()
            .filter(|e| matches!(e, SessionEvent::RemoteFallback { .. }))
            .count()
    }
}

#[test]
fn remote_instance_streams_audio_and_controls() {
    let fixture = RemoteFixture::new();
    let (controller, pump, state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));

    // The node delivered the unit's parameter surface over the wire.
    assert_eq!(controller.window().surface().len(), 2);
    assert_eq!(controller.window().status().target, format!("127.0.0.1:{}", fixture.server.port()));

    // Return stream fills in; silence only until the first packets land.
    drop(pump);
    assert!(render_until(&state, 2000, |buf| buf
        .iter()
        .any(|&s| s.abs() > 0.001)));

    assert_eq!(fixture.server.instance_count(), 1);
    controller.close();
}

#[test]
fn evicted_factory_is_recompiled_once_and_recovered() {
    let fixture = RemoteFixture::new();
    let (mut controller, _pump, _state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));

    // The node loses its compile cache behind our back.
    fixture.server.evict_factories();
    assert_eq!(fixture.server.factory_count(), 0);

    // Same source, so the session reuses its cached factory handle: the
    // instance request hits FactoryNotFound, re-uploads, retries once - and
    // wins.
    let result = controller.update_session(fixture.remote_def("tone-b", "sine 440"));
    assert!(result.is_ok(), "recovery failed: {:?}", result.err());
    assert_eq!(controller.window().status().program, "tone-b");
    assert_eq!(fixture.server.factory_count(), 1);
    controller.close();
}

#[test]
fn failed_recovery_is_unrecoverable_and_rolls_back() {
    let fixture = RemoteFixture::new();
    let (mut controller, _pump, _state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));

    // Evict the factory AND break the node's compiler: the single
    // recompile-and-reupload cycle cannot succeed.
    fixture.server.evict_factories();
    fixture.poison.store(true, Ordering::SeqCst);

    let result = controller.update_session(fixture.remote_def("tone-b", "sine 440"));
    assert!(matches!(
        result,
        Err(UpdateError::RemoteFactoryUnrecoverable(_))
    ));

    // Rollback property: the window still runs the original program.
    assert_eq!(controller.window().status().program, "tone");

    fixture.poison.store(false, Ordering::SeqCst);
    controller.close();
}

#[test]
fn instance_failure_with_intact_factory_is_not_retried() {
    let fixture = RemoteFixture::new();
    let (mut controller, _pump, _state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));

    // The factory compiles fine node-side but instantiation always fails.
    let result = controller.update_session(fixture.remote_def("bad", "failinst"));
    assert!(matches!(result, Err(UpdateError::InstanceCreation(_))));
    assert_eq!(controller.window().status().program, "tone");
    controller.close();
}

#[test]
fn faults_inside_debounce_window_are_coalesced() {
    let fixture = RemoteFixture::new();
    let (mut controller, _pump, _state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));
    let link = fixture.ctx.link_to("127.0.0.1", fixture.server.port()).unwrap();
    let base = Instant::now();

    // A fault 1s after the window opened: inside the window, swallowed.
    link.inject_fault(FaultKind::Read, "stream read failed");
    assert!(controller
        .pump_faults_at(base + Duration::from_secs(1))
        .is_none());
    assert_eq!(fixture.fallback_events(), 0);
    assert_eq!(controller.window().status().program, "tone");
    controller.close();
}

#[test]
fn fault_after_quiet_period_falls_back_to_local() {
    let fixture = RemoteFixture::new();
    let (mut controller, _pump, _state) =
        fixture.open("win", fixture.remote_def("tone", "sine 440"));
    let link = fixture.ctx.link_to("127.0.0.1", fixture.server.port()).unwrap();
    let base = Instant::now();

    // Two faults land together after a 5s quiet period: one fallback, the
    // second observation coalesces against the first.
    link.inject_fault(FaultKind::Read, "stream read failed");
    link.inject_fault(FaultKind::Write, "stream write failed");
    let outcome = controller.pump_faults_at(base + Duration::from_secs(5));
    assert!(matches!(outcome, Some(Ok(()))));
    assert_eq!(fixture.fallback_events(), 1);

    // Same program, now running locally through the full update protocol.
    let status = controller.window().status();
    assert_eq!(status.program, "tone");
    assert_eq!(status.target, "local");

    // A straggler fault after the fallback is ignored: no remote unit left.
    link.inject_fault(FaultKind::Read, "late fault");
    assert!(controller
        .pump_faults_at(base + Duration::from_secs(20))
        .is_none());
    controller.close();
}
