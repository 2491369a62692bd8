//! Audio engine: control-side handle plus the CPAL stream owner.

use crate::error::{Error, Result};
use crate::fade::FadeRamp;
use crate::render::{render, RenderCommand, RenderEvent, RenderState, RetireReason, UnitHost};
use crate::rt::AtomicFloat;
use crate::unit::ProcessingUnit;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub output_device_index: Option<usize>,
    /// Maximum frames per render chunk; scratch buffers are sized to this.
    pub block_frames: usize,
    /// Default crossfade length for hot-swaps.
    pub fade_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_device_index: None,
            block_frames: 512,
            fade_duration: Duration::from_millis(200),
        }
    }
}

/// Control-thread side of the render state.
///
/// Cheap to clone; every window keeps one. Handoffs are validated and
/// allocated here, then moved to the audio thread over a bounded channel.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<RenderCommand>,
    events: Receiver<RenderEvent>,
    device_fault_tx: Sender<String>,
    device_fault_rx: Receiver<String>,
    sample_rate: f64,
    channels: usize,
    block_frames: usize,
    fade_progress: Arc<AtomicFloat>,
}

impl EngineHandle {
    /// Build a render-state/handle pair without an audio device. Tests and
    /// offline rendering drive [`render`] on the returned state themselves.
    pub fn detached(
        sample_rate: f64,
        channels: usize,
        block_frames: usize,
    ) -> (Arc<RenderState>, EngineHandle) {
        let (command_tx, command_rx) = bounded(2);
        let (event_tx, event_rx) = bounded(4);
        let (device_fault_tx, device_fault_rx) = bounded(16);
        let fade_progress = Arc::new(AtomicFloat::new(1.0));

        let state = Arc::new(RenderState::new(
            sample_rate,
            channels,
            block_frames,
            command_rx,
            event_tx,
            fade_progress.clone(),
        ));
        let handle = EngineHandle {
            commands: command_tx,
            events: event_rx,
            device_fault_tx,
            device_fault_rx,
            sample_rate,
            channels,
            block_frames,
            fade_progress,
        };
        (state, handle)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// 1.0 when no fade is active, the ramp position while one is. Any read
    /// at or past the fade duration reports 1.0 - fully the new unit.
    pub fn fade_progress(&self) -> f32 {
        self.fade_progress.get()
    }

    fn check_geometry(&self, unit: &dyn ProcessingUnit) -> Result<()> {
        if unit.outputs() > self.channels {
            return Err(Error::ChannelConfig {
                requested: unit.outputs(),
                available: self.channels,
            });
        }
        Ok(())
    }

    /// Make `unit` current with no blend. Used for the first install of a
    /// window; later swaps go through [`begin_fade`](Self::begin_fade).
    pub fn install(&self, unit: Box<dyn ProcessingUnit>) -> Result<()> {
        self.check_geometry(unit.as_ref())?;
        let host = UnitHost::new(unit, self.block_frames);
        self.commands
            .try_send(RenderCommand::Install(host))
            .map_err(|_| Error::EngineBusy)
    }

    /// Start a crossfade to `incoming`. Returns synchronously; completion is
    /// observed via [`wait_fade_end`](Self::wait_fade_end). Channel-geometry
    /// mismatches are reported here, before the audio thread is involved.
    pub fn begin_fade(&self, incoming: Box<dyn ProcessingUnit>, duration: Duration) -> Result<()> {
        self.check_geometry(incoming.as_ref())?;
        let host = UnitHost::new(incoming, self.block_frames);
        let ramp = FadeRamp::new(duration, self.sample_rate);
        self.commands
            .try_send(RenderCommand::Fade {
                incoming: host,
                ramp,
            })
            .map_err(|_| Error::EngineBusy)
    }

    /// Block the calling (non-audio) thread until the engine signals fade
    /// completion, returning the retired unit (`None` when the fade started
    /// from silence). A condition wait on the event channel, not polling.
    pub fn wait_fade_end(&self, timeout: Duration) -> Result<Option<UnitHost>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if event.reason == RetireReason::FadeComplete => {
                    return Ok(event.retired);
                }
                // Units displaced by a bare install just get dropped here.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(Error::FadeTimeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::RenderDetached),
            }
        }
    }

    /// Drain any retired units parked in the event channel.
    pub fn reap_retired(&self) {
        while self.events.try_recv().is_ok() {}
    }

    /// Receiver for device-level stream errors (the stream collapsed, the
    /// device went away). The session forwards these to the UI.
    pub fn device_faults(&self) -> Receiver<String> {
        self.device_fault_rx.clone()
    }
}

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
///
/// `cpal::Stream` is `!Send` due to platform internals. This is safe because
/// the stream never moves across threads after creation - it lives inside
/// `AudioEngine` until the engine stops or drops.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

// SAFETY: the stream stays on the thread that created it; AudioEngine is not
// shared across threads while running.
unsafe impl Send for StreamHandle {}

/// Owns the hardware output stream and the render state behind it.
pub struct AudioEngine {
    sample_rate: f64,
    channels: usize,
    config: EngineConfig,
    state: Arc<RenderState>,
    handle: EngineHandle,
    is_running: bool,
    _stream: Option<StreamHandle>,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let device = Self::get_device(config.output_device_index)?;
        let output_config = device.default_output_config()?;
        let sample_rate = output_config.sample_rate().0 as f64;
        let channels = output_config.channels() as usize;

        let (state, handle) = EngineHandle::detached(sample_rate, channels, config.block_frames);

        Ok(Self {
            sample_rate,
            channels,
            config,
            state,
            handle,
            is_running: false,
            _stream: None,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running {
            return Ok(());
        }

        let device = Self::get_device(self.config.output_device_index)?;
        let config = device.default_output_config()?;

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, &config.into())?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, &config.into())?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, &config.into())?,
            format => {
                return Err(Error::InvalidConfig(format!(
                    "Unsupported sample format: {:?}",
                    format
                )));
            }
        };

        stream.play()?;
        self._stream = Some(StreamHandle(stream));
        self.is_running = true;
        tracing::info!(sample_rate = self.sample_rate, channels = self.channels, "audio started");

        Ok(())
    }

    pub fn stop(&mut self) {
        self._stream = None;
        self.is_running = false;
    }

    fn build_stream<T>(&self, device: &cpal::Device, config: &cpal::StreamConfig) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let state = self.state.clone();
        let channels = self.channels;
        let mut scratch = vec![0.0f32; self.config.block_frames * channels * 4];
        let fault_tx = self.handle.device_fault_tx.clone();

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let buf = &mut scratch[..data.len()];
                    render(&state, buf);
                    for (sample, &value) in data.iter_mut().zip(buf.iter()) {
                        *sample = T::from_sample(value);
                    }
                }));

                if result.is_err() {
                    // Panic in render - output silence
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0);
                    }
                }
            },
            move |err| {
                // Cannot log from the audio system's error thread either;
                // hand it to the control side.
                let _ = fault_tx.try_send(err.to_string());
            },
            None,
        )?;

        Ok(stream)
    }

    fn get_device(index: Option<usize>) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(idx) = index {
            let devices: Vec<_> = host.output_devices()?.collect();
            let device_count = devices.len();
            devices.into_iter().nth(idx).ok_or_else(|| {
                Error::InvalidDevice(format!(
                    "Output device index {} out of range (available: {})",
                    idx, device_count
                ))
            })
        } else {
            host.default_output_device()
                .ok_or_else(|| Error::InvalidDevice("No output device available".to_string()))
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// List available output devices.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Result<Vec<String>> = host
            .output_devices()?
            .enumerate()
            .map(|(idx, device)| Ok(format!("{}: {}", idx, device.name()?)))
            .collect();
        devices
    }

    /// Resolve a saved device name to its current index, for recalling a
    /// window's routing snapshot. `None` when the device is gone.
    pub fn find_output_device(name: &str) -> Result<Option<usize>> {
        let host = cpal::default_host();
        for (idx, device) in host.output_devices()?.enumerate() {
            if device.name()? == name {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    /// Get the name of the current output device.
    pub fn current_output_device_name(&self) -> Result<String> {
        let device = Self::get_device(self.config.output_device_index)?;
        Ok(device.name()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{SilenceUnit, SineUnit};

    #[test]
    fn test_geometry_rejected_synchronously() {
        let (_state, handle) = EngineHandle::detached(48_000.0, 1, 128);
        let err = handle.install(Box::new(SineUnit::new(440.0, 48_000.0)));
        assert!(matches!(
            err,
            Err(Error::ChannelConfig {
                requested: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn test_wait_fade_end_times_out_without_render() {
        let (_state, handle) = EngineHandle::detached(48_000.0, 2, 128);
        handle.install(Box::new(SilenceUnit)).unwrap();
        handle
            .begin_fade(Box::new(SilenceUnit), Duration::from_millis(5))
            .unwrap();
        // Nothing drives the render state, so the fade never completes.
        let result = handle.wait_fade_end(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::FadeTimeout(_))));
    }

    #[test]
    fn test_fade_completion_wakes_waiter() {
        let (state, handle) = EngineHandle::detached(48_000.0, 2, 64);
        handle.install(Box::new(SilenceUnit)).unwrap();
        handle
            .begin_fade(
                Box::new(SineUnit::new(330.0, 48_000.0)),
                Duration::from_millis(1),
            )
            .unwrap();

        let pump = std::thread::spawn(move || {
            let mut buf = vec![0.0f32; 2 * 64];
            for _ in 0..8 {
                render(&state, &mut buf);
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let retired = handle.wait_fade_end(Duration::from_secs(1)).unwrap();
        assert!(retired.is_some());
        pump.join().unwrap();
    }

    #[test]
    fn test_fade_from_empty_completes_with_no_retiree() {
        let (state, handle) = EngineHandle::detached(48_000.0, 2, 64);
        handle
            .begin_fade(Box::new(SilenceUnit), Duration::from_millis(1))
            .unwrap();
        let mut buf = vec![0.0f32; 2 * 64];
        render(&state, &mut buf);
        let retired = handle.wait_fade_end(Duration::from_millis(100)).unwrap();
        assert!(retired.is_none());
    }
}
