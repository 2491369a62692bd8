//! Shared fixtures for the integration tests: a test compiler with faultable
//! behavior, deterministic units, and a thread that stands in for the audio
//! callback.

#![allow(dead_code)]

use segue::core::{
    render, AtomicFloat, BuiltinCompiler, Error, ParamSpec, ProcessingUnit, RenderState,
    UnitCompiler, UnitDefinition, UnitFactory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Unit producing a constant DC value on both channels. Lets tests read the
/// crossfade blend directly off the output buffer.
pub struct ConstUnit {
    value: f32,
}

impl ConstUnit {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl ProcessingUnit for ConstUnit {
    fn inputs(&self) -> usize {
        0
    }

    fn outputs(&self) -> usize {
        2
    }

    fn process(&mut self, frames: usize, _inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        for channel in outputs.iter_mut() {
            channel[..frames].fill(self.value);
        }
    }
}

/// Unit with more output channels than a stereo stream carries.
struct WideUnit {
    outputs: usize,
}

impl ProcessingUnit for WideUnit {
    fn inputs(&self) -> usize {
        0
    }

    fn outputs(&self) -> usize {
        self.outputs
    }

    fn process(&mut self, frames: usize, _inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        for channel in outputs.iter_mut() {
            channel[..frames].fill(0.0);
        }
    }
}

/// Unit whose parameter surface cannot be bound (duplicate control ids).
struct DupCtlUnit;

impl ProcessingUnit for DupCtlUnit {
    fn inputs(&self) -> usize {
        0
    }

    fn outputs(&self) -> usize {
        2
    }

    fn process(&mut self, frames: usize, _inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        for channel in outputs.iter_mut() {
            channel[..frames].fill(0.0);
        }
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("ctl", "Control", 0.0, 1.0, 0.5),
            ParamSpec::new("ctl", "Control", 0.0, 1.0, 0.5),
        ]
    }

    fn param_endpoint(&self, _id: &str) -> Option<Arc<AtomicFloat>> {
        Some(Arc::new(AtomicFloat::new(0.5)))
    }
}

enum TestPatch {
    Const(f32),
    Wide(usize),
    DupCtl,
    FailInst,
}

struct TestFactory {
    patch: TestPatch,
}

impl UnitFactory for TestFactory {
    fn name(&self) -> &str {
        match self.patch {
            TestPatch::Const(_) => "const",
            TestPatch::Wide(_) => "wide",
            TestPatch::DupCtl => "dupctl",
            TestPatch::FailInst => "failinst",
        }
    }

    fn inputs(&self) -> usize {
        0
    }

    fn outputs(&self) -> usize {
        match self.patch {
            TestPatch::Wide(outputs) => outputs,
            _ => 2,
        }
    }

    fn instantiate(
        &self,
        _sample_rate: f64,
        _block_size: usize,
    ) -> segue::core::Result<Box<dyn ProcessingUnit>> {
        match self.patch {
            TestPatch::Const(value) => Ok(Box::new(ConstUnit::new(value))),
            TestPatch::Wide(outputs) => Ok(Box::new(WideUnit { outputs })),
            TestPatch::DupCtl => Ok(Box::new(DupCtlUnit)),
            TestPatch::FailInst => Err(Error::Instantiate("unit refuses to start".into())),
        }
    }
}

/// Builtin compiler extended with test-only patches, plus a poison switch
/// that makes every subsequent compile fail (simulating a toolchain outage
/// during factory recovery).
pub struct TestCompiler {
    builtin: BuiltinCompiler,
    poisoned: Arc<AtomicBool>,
}

impl TestCompiler {
    pub fn new() -> Self {
        Self {
            builtin: BuiltinCompiler::new(),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn poison_switch(&self) -> Arc<AtomicBool> {
        self.poisoned.clone()
    }
}

impl UnitCompiler for TestCompiler {
    fn compile(&self, definition: &UnitDefinition) -> segue::core::Result<Arc<dyn UnitFactory>> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::Compile("toolchain offline".into()));
        }

        let source = definition.source().read()?;
        let mut tokens = source.split_whitespace();
        match tokens.next() {
            Some("const") => {
                let value = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(1.0);
                Ok(Arc::new(TestFactory {
                    patch: TestPatch::Const(value),
                }))
            }
            Some("wide") => {
                let outputs = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(4);
                Ok(Arc::new(TestFactory {
                    patch: TestPatch::Wide(outputs),
                }))
            }
            Some("dupctl") => Ok(Arc::new(TestFactory {
                patch: TestPatch::DupCtl,
            })),
            Some("failinst") => Ok(Arc::new(TestFactory {
                patch: TestPatch::FailInst,
            })),
            _ => self.builtin.compile(definition),
        }
    }
}

/// Stand-in for the audio callback: drives the render state from its own
/// thread until dropped, like a device would.
pub struct RenderPump {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RenderPump {
    pub fn start(state: Arc<RenderState>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::spawn(move || {
            let mut buf = vec![0.0f32; state.channels() * 128];
            while !stop_flag.load(Ordering::Relaxed) {
                render(&state, &mut buf);
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for RenderPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Render until `predicate` holds on a fresh buffer, or the attempt budget
/// runs out. For tests that drive the state directly instead of pumping.
pub fn render_until(
    state: &RenderState,
    attempts: usize,
    mut predicate: impl FnMut(&[f32]) -> bool,
) -> bool {
    let mut buf = vec![0.0f32; state.channels() * 128];
    for _ in 0..attempts {
        render(state, &mut buf);
        if predicate(&buf) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
