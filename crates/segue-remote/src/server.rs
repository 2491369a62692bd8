//! Processing-node server.
//!
//! Hosts factories compiled by an injected [`UnitCompiler`] and serves
//! instance creation plus the per-instance audio stream. One control
//! connection per client; each instance attaches its own stream connection.
//! The `segue-node` binary and the integration tests both run this server.

use crate::error::NodeErrorCode;
use crate::protocol::{AudioPacket, NodeReply, NodeRequest};
use crate::transport::Framed;
use dashmap::DashMap;
use parking_lot::Mutex;
use segue_core::{
    AtomicFloat, DspSource, ExecutionTarget, ProcessingUnit, UnitCompiler, UnitDefinition,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct InstanceSlot {
    unit: Mutex<Box<dyn ProcessingUnit>>,
    inputs: usize,
    outputs: usize,
    block_size: usize,
    endpoints: Vec<(String, Arc<AtomicFloat>)>,
}

struct NodeState {
    compiler: Arc<dyn UnitCompiler>,
    factories: DashMap<String, Arc<dyn segue_core::UnitFactory>>,
    instances: DashMap<u64, Arc<InstanceSlot>>,
    next_id: AtomicU64,
}

/// Running node server. Dropping the handle shuts the server down.
pub struct NodeServer {
    addr: std::net::SocketAddr,
    state: Arc<NodeState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl NodeServer {
    /// Bind on `addr` (use port 0 for an ephemeral port) and serve in a
    /// background runtime until the returned server is dropped.
    pub fn bind(addr: &str, compiler: Arc<dyn UnitCompiler>) -> std::io::Result<Self> {
        let state = Arc::new(NodeState {
            compiler,
            factories: DashMap::new(),
            instances: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let bind_addr = addr.to_string();
        let serve_state = state.clone();

        let thread = std::thread::Builder::new()
            .name("segue-node".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = addr_tx.send(Err(err));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match TcpListener::bind(&bind_addr).await {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = addr_tx.send(Err(err));
                            return;
                        }
                    };
                    let local = match listener.local_addr() {
                        Ok(local) => local,
                        Err(err) => {
                            let _ = addr_tx.send(Err(err));
                            return;
                        }
                    };
                    let _ = addr_tx.send(Ok(local));
                    tracing::info!(addr = %local, "processing node listening");

                    let mut shutdown_rx = shutdown_rx;
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => {
                                match accepted {
                                    Ok((stream, peer)) => {
                                        tracing::debug!(peer = %peer, "connection accepted");
                                        let state = serve_state.clone();
                                        tokio::spawn(async move {
                                            serve_connection(Framed::new(stream), state).await;
                                        });
                                    }
                                    Err(err) => {
                                        tracing::warn!(error = %err, "accept failed");
                                    }
                                }
                            }
                            _ = &mut shutdown_rx => break,
                        }
                    }
                });
            })?;

        let addr = addr_rx
            .recv()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "server thread died"))??;

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn factory_count(&self) -> usize {
        self.state.factories.len()
    }

    pub fn instance_count(&self) -> usize {
        self.state.instances.len()
    }

    /// Drop every hosted factory, as if the node's compile cache were lost.
    /// Live instances keep streaming; only future instance requests miss.
    pub fn evict_factories(&self) {
        let evicted = self.state.factories.len();
        self.state.factories.clear();
        tracing::info!(evicted, "factories evicted");
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve_connection(mut framed: Framed, state: Arc<NodeState>) {
    loop {
        let request: NodeRequest = match framed.recv().await {
            Ok(request) => request,
            // Disconnect (or garbage); either way this connection is done.
            Err(_) => return,
        };

        let reply = match request {
            NodeRequest::Ping => NodeReply::Pong,

            NodeRequest::UploadFactory {
                key,
                name,
                source,
                options,
            } => upload_factory(&state, key, name, source, options),

            NodeRequest::DropFactory { key } => {
                state.factories.remove(&key);
                NodeReply::Dropped
            }

            NodeRequest::CreateInstance {
                key,
                params: _,
                sample_rate,
                block_size,
            } => create_instance(&state, &key, sample_rate, block_size),

            NodeRequest::DropInstance { id } => {
                state.instances.remove(&id);
                NodeReply::Dropped
            }

            NodeRequest::AttachStream { id } => {
                let slot = state.instances.get(&id).map(|entry| entry.value().clone());
                match slot {
                    Some(slot) => {
                        if framed.send(&NodeReply::StreamAttached).await.is_err() {
                            return;
                        }
                        stream_audio(framed, slot).await;
                        // Stream detached: the instance is unreachable now.
                        state.instances.remove(&id);
                        return;
                    }
                    None => NodeReply::Error {
                        code: NodeErrorCode::TransportNotStarted,
                    },
                }
            }
        };

        if framed.send(&reply).await.is_err() {
            return;
        }
    }
}

fn upload_factory(
    state: &NodeState,
    key: String,
    name: String,
    source: String,
    options: Vec<String>,
) -> NodeReply {
    let definition = UnitDefinition::new(
        name,
        DspSource::Inline(source),
        ExecutionTarget::Local,
        options,
    );
    match state.compiler.compile(&definition) {
        Ok(factory) => {
            let reply = NodeReply::FactoryReady {
                key: key.clone(),
                inputs: factory.inputs(),
                outputs: factory.outputs(),
            };
            state.factories.insert(key, factory);
            reply
        }
        Err(err) => {
            tracing::warn!(error = %err, "factory compile failed");
            NodeReply::Error {
                code: NodeErrorCode::FactoryNotFound,
            }
        }
    }
}

fn create_instance(
    state: &NodeState,
    key: &str,
    sample_rate: f64,
    block_size: usize,
) -> NodeReply {
    let factory = match state.factories.get(key) {
        Some(factory) => factory.value().clone(),
        None => {
            return NodeReply::Error {
                code: NodeErrorCode::FactoryNotFound,
            }
        }
    };

    let unit = match factory.instantiate(sample_rate, block_size) {
        Ok(unit) => unit,
        Err(err) => {
            tracing::warn!(error = %err, "instantiation failed");
            return NodeReply::Error {
                code: NodeErrorCode::InstanceNotCreated,
            };
        }
    };

    let specs = unit.param_specs();
    let endpoints = specs
        .iter()
        .filter_map(|spec| unit.param_endpoint(&spec.id).map(|e| (spec.id.clone(), e)))
        .collect();

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let slot = Arc::new(InstanceSlot {
        inputs: unit.inputs(),
        outputs: unit.outputs(),
        block_size,
        endpoints,
        unit: Mutex::new(unit),
    });
    let reply = NodeReply::InstanceReady {
        id,
        inputs: slot.inputs,
        outputs: slot.outputs,
        params: specs,
    };
    state.instances.insert(id, slot);
    reply
}

/// Per-packet compute loop for one attached stream. Runs until the client
/// disconnects or the instance is dropped.
async fn stream_audio(mut framed: Framed, slot: Arc<InstanceSlot>) {
    let block = slot.block_size;
    let mut inputs = vec![vec![0.0f32; block]; slot.inputs];
    let mut outputs = vec![vec![0.0f32; block]; slot.outputs];
    let mut out_samples = vec![0.0f32; block * slot.outputs];

    loop {
        let packet: AudioPacket = match framed.recv().await {
            Ok(packet) => packet,
            Err(_) => return,
        };

        for (id, value) in &packet.params {
            if let Some((_, endpoint)) = slot.endpoints.iter().find(|(eid, _)| eid == id) {
                endpoint.set(*value);
            }
        }

        let frames = (packet.frames as usize).min(block);
        for frame in 0..frames {
            for channel in 0..slot.inputs {
                inputs[channel][frame] = packet
                    .samples
                    .get(frame * slot.inputs + channel)
                    .copied()
                    .unwrap_or(0.0);
            }
        }

        {
            let mut unit = slot.unit.lock();
            unit.process(frames, &inputs, &mut outputs);
        }

        for frame in 0..frames {
            for channel in 0..slot.outputs {
                out_samples[frame * slot.outputs + channel] = outputs[channel][frame];
            }
        }

        let reply = AudioPacket {
            frames: frames as u32,
            samples: out_samples[..frames * slot.outputs].to_vec(),
            params: Vec::new(),
        };
        if framed.send(&reply).await.is_err() {
            return;
        }
    }
}
