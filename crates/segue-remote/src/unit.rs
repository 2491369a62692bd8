//! Remote processing unit - the local face of an instance running on a node.
//!
//! The audio callback talks only to a pair of SPSC sample rings; a dedicated
//! pump thread exchanges packets with the node and keeps the return ring
//! primed. Underruns produce silence, never a blocked callback. Transport
//! errors stop the pump and surface as faults on the link's fault channel.

use crate::error::{FaultKind, RemoteFault};
use crate::protocol::AudioPacket;
use crate::transport::SyncFramed;
use crossbeam_channel::Sender;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use segue_core::{AtomicFlag, AtomicFloat, ParamSpec, ProcessingUnit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct RemoteUnitConfig {
    pub instance_id: u64,
    pub inputs: usize,
    pub outputs: usize,
    pub specs: Vec<ParamSpec>,
    pub block_size: usize,
    pub sample_rate: f64,
    pub latency_ms: u32,
}

/// A [`ProcessingUnit`] whose computation happens on a remote node.
pub struct RemoteUnit {
    inputs: usize,
    outputs: usize,
    instance_id: u64,
    specs: Vec<ParamSpec>,
    endpoints: Vec<(String, Arc<AtomicFloat>)>,
    to_node: HeapProd<f32>,
    from_node: HeapCons<f32>,
    in_scratch: Vec<f32>,
    out_scratch: Vec<f32>,
    block_size: usize,
    underruns: Arc<AtomicU64>,
    stop: Arc<AtomicFlag>,
    shutdown_sock: Option<SyncFramed>,
    pump: Option<JoinHandle<()>>,
}

impl RemoteUnit {
    pub(crate) fn start(
        stream: SyncFramed,
        config: RemoteUnitConfig,
        faults: Sender<RemoteFault>,
    ) -> std::io::Result<Self> {
        let RemoteUnitConfig {
            instance_id,
            inputs,
            outputs,
            specs,
            block_size,
            sample_rate,
            latency_ms,
        } = config;

        // The return ring holds the latency budget's worth of audio; the
        // send ring mirrors it so input back-pressure matches.
        let latency_frames =
            ((sample_rate * latency_ms as f64 / 1000.0) as usize).max(block_size * 2);
        let to_node_rb = HeapRb::<f32>::new((latency_frames * inputs).max(1));
        let from_node_rb = HeapRb::<f32>::new((latency_frames * outputs).max(1));
        let (to_node, pump_in) = to_node_rb.split();
        let (pump_out, from_node) = from_node_rb.split();

        let endpoints: Vec<(String, Arc<AtomicFloat>)> = specs
            .iter()
            .map(|spec| (spec.id.clone(), Arc::new(AtomicFloat::new(spec.default))))
            .collect();

        let stop = Arc::new(AtomicFlag::new(false));
        let underruns = Arc::new(AtomicU64::new(0));
        let shutdown_sock = stream.try_clone()?;

        let pump = {
            let endpoints = endpoints.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("segue-stream-{}", instance_id))
                .spawn(move || {
                    pump_loop(
                        stream, pump_in, pump_out, endpoints, stop, faults, block_size, inputs,
                        outputs,
                    )
                })?
        };

        Ok(Self {
            inputs,
            outputs,
            instance_id,
            specs,
            endpoints,
            to_node,
            from_node,
            in_scratch: vec![0.0; block_size * inputs.max(1)],
            out_scratch: vec![0.0; block_size * outputs.max(1)],
            block_size,
            underruns,
            stop,
            shutdown_sock: Some(shutdown_sock),
            pump: Some(pump),
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Number of blocks the return stream has missed so far.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl ProcessingUnit for RemoteUnit {
    fn inputs(&self) -> usize {
        self.inputs
    }

    fn outputs(&self) -> usize {
        self.outputs
    }

    fn process(&mut self, frames: usize, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>]) {
        let frames = frames.min(self.block_size);

        // Ship input samples toward the node; a full ring drops the block.
        if self.inputs > 0 {
            let needed = frames * self.inputs;
            for frame in 0..frames {
                for (channel, input) in inputs.iter().take(self.inputs).enumerate() {
                    self.in_scratch[frame * self.inputs + channel] = input[frame];
                }
            }
            let _ = self.to_node.push_slice(&self.in_scratch[..needed]);
        }

        // Pull the return stream; not enough buffered means silence.
        let needed = frames * self.outputs;
        if self.outputs == 0 {
            return;
        }
        if self.from_node.occupied_len() >= needed {
            self.from_node.pop_slice(&mut self.out_scratch[..needed]);
            for frame in 0..frames {
                for (channel, output) in outputs.iter_mut().take(self.outputs).enumerate() {
                    output[frame] = self.out_scratch[frame * self.outputs + channel];
                }
            }
        } else {
            for output in outputs.iter_mut() {
                output[..frames].fill(0.0);
            }
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        self.specs.clone()
    }

    fn param_endpoint(&self, id: &str) -> Option<Arc<AtomicFloat>> {
        self.endpoints
            .iter()
            .find(|(endpoint_id, _)| endpoint_id == id)
            .map(|(_, endpoint)| endpoint.clone())
    }
}

impl Drop for RemoteUnit {
    fn drop(&mut self) {
        self.stop.set(true);
        if let Some(sock) = self.shutdown_sock.take() {
            sock.shutdown();
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn pump_loop(
    mut stream: SyncFramed,
    mut from_engine: HeapCons<f32>,
    mut to_engine: HeapProd<f32>,
    endpoints: Vec<(String, Arc<AtomicFloat>)>,
    stop: Arc<AtomicFlag>,
    faults: Sender<RemoteFault>,
    block_size: usize,
    inputs: usize,
    outputs: usize,
) {
    let packet_in = block_size * inputs;
    let packet_out = block_size * outputs;
    let mut in_buf = vec![0.0f32; packet_in];
    let mut last_sent: Vec<f32> = endpoints.iter().map(|(_, e)| e.get()).collect();

    loop {
        if stop.get() {
            break;
        }

        // Only exchange when the return ring can absorb a full packet.
        // Output-less units pace on the timer alone.
        if packet_out > 0 {
            if to_engine.vacant_len() < packet_out {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }

        let got = from_engine.pop_slice(&mut in_buf);
        in_buf[got..].fill(0.0);

        let mut params = Vec::new();
        for (index, (id, endpoint)) in endpoints.iter().enumerate() {
            let value = endpoint.get();
            if value != last_sent[index] {
                params.push((id.clone(), value));
                last_sent[index] = value;
            }
        }

        let packet = AudioPacket {
            frames: block_size as u32,
            samples: in_buf.clone(),
            params,
        };

        if let Err(err) = stream.send(&packet) {
            if !stop.get() {
                let _ = faults.send(RemoteFault {
                    kind: FaultKind::Write,
                    detail: err.to_string(),
                });
            }
            break;
        }

        match stream.recv::<AudioPacket>() {
            Ok(reply) => {
                to_engine.push_slice(&reply.samples);
            }
            Err(err) => {
                if !stop.get() {
                    let _ = faults.send(RemoteFault {
                        kind: FaultKind::Read,
                        detail: err.to_string(),
                    });
                }
                break;
            }
        }
    }
}
