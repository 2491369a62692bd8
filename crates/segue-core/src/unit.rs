//! The processing-unit capability trait and its parameter surface.

use crate::rt::AtomicFloat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Description of one user-facing control exposed by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Stable identifier, unique within the unit (path-style, e.g. "osc/freq").
    pub id: String,
    /// Display label.
    pub label: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ParamSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            min,
            max,
            default,
        }
    }
}

/// One live, stateful audio unit derived from a factory.
///
/// Channel counts are fixed at creation. `process` runs on the audio thread
/// and must not block, allocate or panic; everything it needs is handed over
/// before the unit reaches the callback. Parameters are read through
/// lock-free [`AtomicFloat`] endpoints the unit samples each block, so
/// control surfaces never touch the unit itself.
pub trait ProcessingUnit: Send {
    /// Input channel count, fixed at creation.
    fn inputs(&self) -> usize;

    /// Output channel count, fixed at creation.
    fn outputs(&self) -> usize;

    /// Compute `frames` samples. `inputs` and `outputs` are planar buffers
    /// with at least `frames` samples per channel, preallocated by the host.
    fn process(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]);

    /// Controls this unit exposes. Empty for units with no parameters.
    fn param_specs(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Lock-free endpoint for one parameter, shared with control surfaces.
    fn param_endpoint(&self, _id: &str) -> Option<Arc<AtomicFloat>> {
        None
    }

    /// Clear internal state (delay lines, phase). Called off the audio thread.
    fn reset(&mut self) {}
}

/// Channel geometry of a unit, used for stream validation and remote replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    pub inputs: usize,
    pub outputs: usize,
}

impl ChannelCount {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }

    pub fn of(unit: &dyn ProcessingUnit) -> Self {
        Self {
            inputs: unit.inputs(),
            outputs: unit.outputs(),
        }
    }
}
