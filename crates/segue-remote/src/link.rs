//! Client link to a remote processing node.
//!
//! Request/reply on the control connection is blocking from the caller's
//! perspective; the tokio runtime lives inside the link and never leaks out.
//! Transport faults - from the control channel or from any live instance's
//! audio stream - are delivered on a bounded event channel the session drains
//! on its own thread.

use crate::error::{FaultKind, NodeErrorCode, RemoteError, RemoteFault, Result};
use crate::protocol::{NodeReply, NodeRequest, StreamParams};
use crate::transport::{Framed, SyncFramed};
use crate::unit::{RemoteUnit, RemoteUnitConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use segue_core::UnitDefinition;
use std::time::Duration;
use tokio::sync::Mutex;

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a factory hosted on a remote node.
///
/// The node may evict the factory at any time; holders find out through
/// [`NodeErrorCode::FactoryNotFound`] on the next instance request.
#[derive(Debug, Clone)]
pub struct RemoteFactoryHandle {
    pub key: String,
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
}

/// Connection to one processing node.
pub struct RemoteLink {
    host: String,
    port: u16,
    runtime: tokio::runtime::Runtime,
    control: Mutex<Option<Framed>>,
    fault_tx: Sender<RemoteFault>,
    fault_rx: Receiver<RemoteFault>,
    request_timeout: Duration,
}

impl RemoteLink {
    /// Connect to `host:port`. Blocks until the control connection is up.
    pub fn connect(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::connect_with_timeout(host, port, Duration::from_secs(5))
    }

    pub fn connect_with_timeout(
        host: impl Into<String>,
        port: u16,
        request_timeout: Duration,
    ) -> Result<Self> {
        let host = host.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        let control = runtime
            .block_on(async {
                tokio::time::timeout(request_timeout, Framed::connect(&host, port)).await
            })
            .map_err(|_| RemoteError::Timeout {
                operation: "connect".into(),
                duration_ms: request_timeout.as_millis() as u64,
            })?
            .map_err(|err| RemoteError::ConnectionFailed(err.to_string()))?;

        let (fault_tx, fault_rx) = bounded(FAULT_CHANNEL_CAPACITY);

        tracing::info!(host = %host, port, "connected to processing node");

        Ok(Self {
            host,
            port,
            runtime,
            control: Mutex::new(Some(control)),
            fault_tx,
            fault_rx,
            request_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receiver for transport faults. Cheap to clone; the session drains it
    /// from the control thread.
    pub fn faults(&self) -> Receiver<RemoteFault> {
        self.fault_rx.clone()
    }

    fn fault(&self, kind: FaultKind, detail: impl Into<String>) {
        let _ = self.fault_tx.try_send(RemoteFault {
            kind,
            detail: detail.into(),
        });
    }

    /// One request/reply round trip on the control connection. A transport
    /// failure poisons the connection and raises a fault event.
    fn request(&self, request: NodeRequest, operation: &'static str) -> Result<NodeReply> {
        self.runtime.block_on(async {
            let mut guard = self.control.lock().await;
            let control = guard.as_mut().ok_or(RemoteError::LinkClosed)?;

            let exchange = async {
                if let Err(err) = control.send(&request).await {
                    return Err((FaultKind::Write, err));
                }
                control.recv::<NodeReply>().await.map_err(|err| (FaultKind::Read, err))
            };
            let outcome = tokio::time::timeout(self.request_timeout, exchange).await;

            match outcome {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err((kind, err))) => {
                    *guard = None;
                    self.fault(kind, err.to_string());
                    Err(err)
                }
                Err(_) => {
                    *guard = None;
                    self.fault(FaultKind::Read, format!("{} timed out", operation));
                    Err(RemoteError::Timeout {
                        operation: operation.into(),
                        duration_ms: self.request_timeout.as_millis() as u64,
                    })
                }
            }
        })
    }

    pub fn ping(&self) -> Result<()> {
        match self.request(NodeRequest::Ping, "ping")? {
            NodeReply::Pong => Ok(()),
            NodeReply::Error { code } => Err(RemoteError::Node(code)),
            _ => Err(RemoteError::UnexpectedReply("ping")),
        }
    }

    /// Ship a definition's source to the node for compilation. This is both
    /// the initial upload and the recompile step of factory recovery.
    pub fn upload_factory(&self, definition: &UnitDefinition) -> Result<RemoteFactoryHandle> {
        let source = definition.source().read()?;
        let key = definition.content_key();
        tracing::info!(name = definition.name(), "uploading factory to node");

        let reply = self.request(
            NodeRequest::UploadFactory {
                key: key.clone(),
                name: definition.name().to_string(),
                source,
                options: definition.compile_options().to_vec(),
            },
            "upload factory",
        )?;

        match reply {
            NodeReply::FactoryReady {
                key,
                inputs,
                outputs,
            } => Ok(RemoteFactoryHandle {
                key,
                name: definition.name().to_string(),
                inputs,
                outputs,
            }),
            NodeReply::Error { code } => Err(RemoteError::Node(code)),
            _ => Err(RemoteError::UnexpectedReply("upload factory")),
        }
    }

    pub fn drop_factory(&self, handle: &RemoteFactoryHandle) -> Result<()> {
        match self.request(
            NodeRequest::DropFactory {
                key: handle.key.clone(),
            },
            "drop factory",
        )? {
            NodeReply::Dropped => Ok(()),
            NodeReply::Error { code } => Err(RemoteError::Node(code)),
            _ => Err(RemoteError::UnexpectedReply("drop factory")),
        }
    }

    /// Create one live instance from a previously uploaded factory and attach
    /// its audio stream. [`NodeErrorCode::FactoryNotFound`] here means the
    /// node evicted the factory; the caller re-uploads and retries once.
    pub fn create_instance(
        &self,
        handle: &RemoteFactoryHandle,
        params: StreamParams,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<RemoteUnit> {
        let latency_ms = params.latency_ms;
        let reply = self.request(
            NodeRequest::CreateInstance {
                key: handle.key.clone(),
                params,
                sample_rate,
                block_size,
            },
            "create instance",
        )?;

        let (id, inputs, outputs, specs) = match reply {
            NodeReply::InstanceReady {
                id,
                inputs,
                outputs,
                params,
            } => (id, inputs, outputs, params),
            NodeReply::Error { code } => return Err(RemoteError::Node(code)),
            _ => return Err(RemoteError::UnexpectedReply("create instance")),
        };

        let stream = self.attach_stream(id)?;

        let unit = RemoteUnit::start(
            stream,
            RemoteUnitConfig {
                instance_id: id,
                inputs,
                outputs,
                specs,
                block_size,
                sample_rate,
                latency_ms,
            },
            self.fault_tx.clone(),
        )?;

        tracing::info!(instance = id, inputs, outputs, "remote instance ready");
        Ok(unit)
    }

    fn attach_stream(&self, id: u64) -> Result<SyncFramed> {
        let mut stream = SyncFramed::connect(&self.host, self.port)
            .map_err(|err| RemoteError::ConnectionFailed(err.to_string()))?;
        stream.send(&NodeRequest::AttachStream { id })?;
        match stream.recv::<NodeReply>()? {
            NodeReply::StreamAttached => Ok(stream),
            NodeReply::Error { code } => Err(RemoteError::Node(code)),
            _ => Err(RemoteError::UnexpectedReply("attach stream")),
        }
    }

    /// Release a node-side instance. The local [`RemoteUnit`] cleans up its
    /// own pump on drop; this frees the node's half.
    pub fn drop_instance(&self, id: u64) -> Result<()> {
        match self.request(NodeRequest::DropInstance { id }, "drop instance")? {
            NodeReply::Dropped => Ok(()),
            NodeReply::Error { code } => Err(RemoteError::Node(code)),
            _ => Err(RemoteError::UnexpectedReply("drop instance")),
        }
    }

    /// Inject a fault event as if it came from a live stream. Test hook for
    /// exercising the session's debounce without killing a socket.
    #[doc(hidden)]
    pub fn inject_fault(&self, kind: FaultKind, detail: impl Into<String>) {
        self.fault(kind, detail);
    }
}

impl std::fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}
