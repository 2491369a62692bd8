//! Built-in units and the one-line builtin patch compiler.
//!
//! Real deployments hand the session a compiler for an actual DSP language;
//! the builtin compiler covers the node binary, demos and tests with a tiny
//! directive syntax: `sine 440`, `gain 0.5`, `silence`. An empty source
//! compiles to the degenerate no-op unit and takes the full update protocol
//! like any other program.

use crate::definition::UnitDefinition;
use crate::error::{Error, Result};
use crate::factory::{UnitCompiler, UnitFactory};
use crate::rt::AtomicFloat;
use crate::unit::{ParamSpec, ProcessingUnit};
use std::f64::consts::TAU;
use std::sync::Arc;

/// No-op unit: zero inputs, stereo silence out, no controls.
pub struct SilenceUnit;

impl ProcessingUnit for SilenceUnit {
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
}

/// Sine oscillator, same tone on both output channels.
pub struct SineUnit {
    freq: Arc<AtomicFloat>,
    level: Arc<AtomicFloat>,
    phase: f64,
    sample_rate: f64,
}

impl SineUnit {
    pub fn new(freq: f32, sample_rate: f64) -> Self {
        Self {
            freq: Arc::new(AtomicFloat::new(freq)),
            level: Arc::new(AtomicFloat::new(0.5)),
            phase: 0.0,
            sample_rate,
        }
    }
}

impl ProcessingUnit for SineUnit {
    fn inputs(&self) -> usize {
        0
    }

    fn outputs(&self) -> usize {
        2
    }

    fn process(&mut self, frames: usize, _inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        // Parameters are sampled once per block.
        let freq = self.freq.get_relaxed() as f64;
        let level = self.level.get_relaxed();
        let step = freq / self.sample_rate;

        for i in 0..frames {
            let sample = (self.phase * TAU).sin() as f32 * level;
            self.phase += step;
            if self.phase >= 1.0 {
                self.phase -= 1.0;
            }
            for channel in outputs.iter_mut() {
                channel[i] = sample;
            }
        }
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("osc/freq", "Frequency", 20.0, 20_000.0, self.freq.get()),
            ParamSpec::new("osc/level", "Level", 0.0, 1.0, self.level.get()),
        ]
    }

    fn param_endpoint(&self, id: &str) -> Option<Arc<AtomicFloat>> {
        match id {
            "osc/freq" => Some(self.freq.clone()),
            "osc/level" => Some(self.level.clone()),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// Stereo gain stage.
pub struct GainUnit {
    gain: Arc<AtomicFloat>,
}

impl GainUnit {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Arc::new(AtomicFloat::new(gain)),
        }
    }
}

impl ProcessingUnit for GainUnit {
    fn inputs(&self) -> usize {
        2
    }

    fn outputs(&self) -> usize {
        2
    }

    fn process(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        let gain = self.gain.get_relaxed();
        for (channel, output) in outputs.iter_mut().enumerate() {
            match inputs.get(channel) {
                Some(input) => {
                    for i in 0..frames {
                        output[i] = input[i] * gain;
                    }
                }
                None => output[..frames].fill(0.0),
            }
        }
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("gain", "Gain", 0.0, 1.0, self.gain.get())]
    }

    fn param_endpoint(&self, id: &str) -> Option<Arc<AtomicFloat>> {
        (id == "gain").then(|| self.gain.clone())
    }
}

enum Patch {
    Silence,
    Sine { freq: f32 },
    Gain { gain: f32 },
}

struct BuiltinFactory {
    name: &'static str,
    patch: Patch,
}

impl UnitFactory for BuiltinFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn inputs(&self) -> usize {
        match self.patch {
            Patch::Gain { .. } => 2,
            _ => 0,
        }
    }

    fn outputs(&self) -> usize {
        2
    }

    fn instantiate(&self, sample_rate: f64, _block_size: usize) -> Result<Box<dyn ProcessingUnit>> {
        Ok(match self.patch {
            Patch::Silence => Box::new(SilenceUnit),
            Patch::Sine { freq } => Box::new(SineUnit::new(freq, sample_rate)),
            Patch::Gain { gain } => Box::new(GainUnit::new(gain)),
        })
    }
}

/// Compiler for the builtin patch syntax.
#[derive(Default)]
pub struct BuiltinCompiler;

impl BuiltinCompiler {
    pub fn new() -> Self {
        Self
    }

    fn parse(source: &str) -> Result<BuiltinFactory> {
        let mut tokens = source.split_whitespace();
        let head = match tokens.next() {
            None => {
                return Ok(BuiltinFactory {
                    name: "silence",
                    patch: Patch::Silence,
                })
            }
            Some(head) => head,
        };

        let factory = match head {
            "silence" => BuiltinFactory {
                name: "silence",
                patch: Patch::Silence,
            },
            "sine" => {
                let freq = Self::number(tokens.next(), 440.0, "sine frequency")?;
                BuiltinFactory {
                    name: "sine",
                    patch: Patch::Sine { freq },
                }
            }
            "gain" => {
                let gain = Self::number(tokens.next(), 1.0, "gain amount")?;
                BuiltinFactory {
                    name: "gain",
                    patch: Patch::Gain { gain },
                }
            }
            other => return Err(Error::Compile(format!("unknown builtin '{}'", other))),
        };

        if let Some(extra) = tokens.next() {
            return Err(Error::Compile(format!("unexpected token '{}'", extra)));
        }
        Ok(factory)
    }

    fn number(token: Option<&str>, default: f32, what: &str) -> Result<f32> {
        match token {
            None => Ok(default),
            Some(text) => text
                .parse()
                .map_err(|_| Error::Compile(format!("bad {}: '{}'", what, text))),
        }
    }
}

impl UnitCompiler for BuiltinCompiler {
    fn compile(&self, definition: &UnitDefinition) -> Result<Arc<dyn UnitFactory>> {
        let source = definition.source().read()?;
        let factory = Self::parse(source.trim())?;
        Ok(Arc::new(factory))
    }
}
