//! Real-time render state: the audio-thread half of the engine.
//!
//! The control thread hands units over through a bounded command channel and
//! gets them back through a bounded event channel; the callback itself never
//! locks, allocates or frees. During a crossfade both units compute every
//! block and their outputs are blended with a precomputed ramp; when the ramp
//! ends the callback performs the single current-unit swap and ships the
//! retired unit back to the control thread.

use crate::fade::FadeRamp;
use crate::rt::AtomicFloat;
use crate::unit::{ChannelCount, ProcessingUnit};
use crossbeam_channel::{Receiver, Sender};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A unit plus the planar scratch it computes into.
///
/// All buffers are allocated on the control thread before handoff.
pub struct UnitHost {
    unit: Box<dyn ProcessingUnit>,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
}

impl UnitHost {
    pub fn new(unit: Box<dyn ProcessingUnit>, max_frames: usize) -> Self {
        let inputs = vec![vec![0.0; max_frames]; unit.inputs()];
        let outputs = vec![vec![0.0; max_frames]; unit.outputs()];
        Self {
            unit,
            inputs,
            outputs,
        }
    }

    pub fn channels(&self) -> ChannelCount {
        ChannelCount::of(self.unit.as_ref())
    }

    /// Take the unit back out, dropping the scratch.
    pub fn into_unit(self) -> Box<dyn ProcessingUnit> {
        self.unit
    }

    pub fn unit(&self) -> &dyn ProcessingUnit {
        self.unit.as_ref()
    }

    #[inline]
    fn compute(&mut self, frames: usize) {
        self.unit.process(frames, &self.inputs, &mut self.outputs);
    }

    /// Sample for interleaved output channel `channel` at `frame`.
    /// Mono units feed every output channel; missing channels are silent.
    #[inline]
    fn sample(&self, frame: usize, channel: usize) -> f32 {
        match self.outputs.len() {
            0 => 0.0,
            1 => self.outputs[0][frame],
            n if channel < n => self.outputs[channel][frame],
            _ => 0.0,
        }
    }
}

pub(crate) enum RenderCommand {
    /// Make this unit current immediately (first install, no blend).
    Install(UnitHost),
    /// Blend from the current unit to `incoming` over `ramp`.
    Fade { incoming: UnitHost, ramp: FadeRamp },
}

/// Why a unit came back over the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    FadeComplete,
    Replaced,
}

pub(crate) struct RenderEvent {
    /// `None` when a fade completed with nothing to retire.
    pub(crate) retired: Option<UnitHost>,
    pub(crate) reason: RetireReason,
}

struct ActiveFade {
    incoming: UnitHost,
    ramp: FadeRamp,
}

/// State owned by the audio callback.
///
/// `UnsafeCell` slots are only touched from the render thread, mirroring the
/// single-consumer discipline of the command channel.
pub struct RenderState {
    current: UnsafeCell<Option<UnitHost>>,
    fade: UnsafeCell<Option<ActiveFade>>,
    commands: Receiver<RenderCommand>,
    events: Sender<RenderEvent>,
    block_frames: usize,
    channels: usize,
    sample_rate: f64,
    /// 1.0 whenever no fade is active; ramp progress while one is.
    fade_progress: Arc<AtomicFloat>,
    position: AtomicU64,
}

unsafe impl Send for RenderState {}
unsafe impl Sync for RenderState {}

impl RenderState {
    pub(crate) fn new(
        sample_rate: f64,
        channels: usize,
        block_frames: usize,
        commands: Receiver<RenderCommand>,
        events: Sender<RenderEvent>,
        fade_progress: Arc<AtomicFloat>,
    ) -> Self {
        fade_progress.set(1.0);
        Self {
            current: UnsafeCell::new(None),
            fade: UnsafeCell::new(None),
            commands,
            events,
            block_frames,
            channels,
            sample_rate,
            fade_progress,
            position: AtomicU64::new(0),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames_rendered(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn current_mut(&self) -> &mut Option<UnitHost> {
        &mut *self.current.get()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn fade_mut(&self) -> &mut Option<ActiveFade> {
        &mut *self.fade.get()
    }

    #[inline]
    fn retire(&self, retired: UnitHost, reason: RetireReason) {
        let _ = self.events.try_send(RenderEvent {
            retired: Some(retired),
            reason,
        });
    }

    fn apply_commands(&self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RenderCommand::Install(host) => {
                    let slot = unsafe { self.current_mut() };
                    if let Some(old) = slot.replace(host) {
                        self.retire(old, RetireReason::Replaced);
                    }
                }
                RenderCommand::Fade { incoming, ramp } => {
                    let fade = unsafe { self.fade_mut() };
                    if fade.is_some() {
                        // Controller serializes fades; a second one is refused.
                        self.retire(incoming, RetireReason::Replaced);
                        continue;
                    }
                    if unsafe { self.current_mut() }.is_none() {
                        // Nothing to blend from: a fade onto silence is an install.
                        *unsafe { self.current_mut() } = Some(incoming);
                        self.fade_progress.set(1.0);
                        let _ = self.events.try_send(RenderEvent {
                            retired: None,
                            reason: RetireReason::FadeComplete,
                        });
                        continue;
                    }
                    self.fade_progress.set(0.0);
                    *fade = Some(ActiveFade { incoming, ramp });
                }
            }
        }
    }
}

/// Render one interleaved buffer. Called from the audio callback (or directly
/// by tests driving the render state without a device).
pub fn render(state: &RenderState, output: &mut [f32]) {
    let channels = state.channels;
    let total_frames = output.len() / channels;

    state.apply_commands();

    let mut done = 0;
    while done < total_frames {
        let frames = (total_frames - done).min(state.block_frames);
        let chunk = &mut output[done * channels..(done + frames) * channels];
        render_chunk(state, chunk, frames);
        done += frames;
    }

    state
        .position
        .fetch_add(total_frames as u64, Ordering::Relaxed);
}

fn render_chunk(state: &RenderState, output: &mut [f32], frames: usize) {
    let channels = state.channels;
    let current = unsafe { state.current_mut() };
    let fade = unsafe { state.fade_mut() };

    let fade_done = match (current.as_mut(), fade.as_mut()) {
        (Some(old), Some(active)) => {
            old.compute(frames);
            active.incoming.compute(frames);

            for frame in 0..frames {
                let gain = active.ramp.next();
                for channel in 0..channels {
                    output[frame * channels + channel] = old.sample(frame, channel)
                        * (1.0 - gain)
                        + active.incoming.sample(frame, channel) * gain;
                }
            }
            state.fade_progress.set(active.ramp.progress());
            active.ramp.is_complete()
        }
        (Some(host), None) => {
            host.compute(frames);
            for frame in 0..frames {
                for channel in 0..channels {
                    output[frame * channels + channel] = host.sample(frame, channel);
                }
            }
            false
        }
        (None, _) => {
            output[..frames * channels].fill(0.0);
            false
        }
    };

    if fade_done {
        if let Some(finished) = fade.take() {
            let retired = current.replace(finished.incoming);
            state.fade_progress.set(1.0);
            if let Some(retired) = retired {
                state.retire(retired, RetireReason::FadeComplete);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHandle;
    use crate::units::{SilenceUnit, SineUnit};
    use std::time::Duration;

    fn pair() -> (Arc<RenderState>, EngineHandle) {
        EngineHandle::detached(48_000.0, 2, 128)
    }

    #[test]
    fn test_silence_without_unit() {
        let (state, _handle) = pair();
        let mut buf = vec![1.0f32; 256];
        render(&state, &mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));
        assert_eq!(state.frames_rendered(), 128);
    }

    #[test]
    fn test_install_makes_unit_audible() {
        let (state, handle) = pair();
        handle
            .install(Box::new(SineUnit::new(440.0, 48_000.0)))
            .unwrap();
        let mut buf = vec![0.0f32; 256];
        render(&state, &mut buf);
        assert!(buf.iter().any(|&s| s.abs() > 0.01));
    }

    #[test]
    fn test_fade_retires_old_unit() {
        let (state, handle) = pair();
        handle.install(Box::new(SilenceUnit)).unwrap();
        handle
            .begin_fade(
                Box::new(SineUnit::new(440.0, 48_000.0)),
                Duration::from_millis(1),
            )
            .unwrap();

        let mut buf = vec![0.0f32; 2 * 128];
        render(&state, &mut buf); // 128 frames > 48 ramp frames
        let retired = handle.wait_fade_end(Duration::from_millis(100)).unwrap();
        assert_eq!(retired.unwrap().channels().outputs, 2);
        assert_eq!(handle.fade_progress(), 1.0);
    }

    #[test]
    fn test_fade_blends_toward_new_unit() {
        let (state, handle) = pair();
        handle.install(Box::new(SilenceUnit)).unwrap();
        // 128-frame ramp at 128-frame blocks: completes in one render call.
        handle
            .begin_fade(
                Box::new(SineUnit::new(1000.0, 48_000.0)),
                Duration::from_secs_f64(128.0 / 48_000.0),
            )
            .unwrap();

        let mut buf = vec![0.0f32; 2 * 128];
        render(&state, &mut buf);

        // Early frames are mostly the old (silent) unit, late frames the sine.
        let early: f32 = buf[..16].iter().map(|s| s.abs()).sum();
        let late: f32 = buf[buf.len() - 64..].iter().map(|s| s.abs()).sum();
        assert!(late > early);
    }
}
