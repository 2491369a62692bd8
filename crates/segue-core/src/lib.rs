//! # segue-core
//!
//! Engine kernel for segue: the processing-unit capability traits, the
//! factory cache, the precomputed crossfade ramp, the real-time render state
//! and the CPAL output stream.
//!
//! The split that matters here is control thread vs. audio thread. Everything
//! that can block or allocate (compiling, instantiation, scratch buffers,
//! ramp precomputation) happens behind [`EngineHandle`]; the audio side
//! ([`render`]) only moves samples, advances a precomputed ramp, and ships
//! retired units back over a bounded channel.

pub mod definition;
pub mod engine;
pub mod error;
pub mod factory;
pub mod fade;
pub mod render;
pub mod rt;
pub mod unit;
pub mod units;

pub use definition::{DspSource, ExecutionTarget, UnitDefinition};
pub use engine::{AudioEngine, EngineConfig, EngineHandle};
pub use error::{Error, Result};
pub use factory::{FactoryCache, UnitCompiler, UnitFactory};
pub use fade::FadeRamp;
pub use render::{render, RenderState, UnitHost};
pub use rt::{AtomicFlag, AtomicFloat};
pub use unit::{ChannelCount, ParamSpec, ProcessingUnit};
pub use units::{BuiltinCompiler, GainUnit, SilenceUnit, SineUnit};
