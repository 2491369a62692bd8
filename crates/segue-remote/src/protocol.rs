//! Wire protocol between the session host and a processing node.

use crate::error::NodeErrorCode;
use segue_core::ParamSpec;
use serde::{Deserialize, Serialize};

/// Return-stream latency budget sent to the node, in milliseconds.
pub const DEFAULT_LATENCY_MS: u32 = 10;

/// Return-stream compression level sent to the node.
pub const DEFAULT_COMPRESSION: u32 = 64;

/// Fixed return-stream configuration sent with every instance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Address the node should associate the return stream with.
    pub return_host: String,
    pub latency_ms: u32,
    pub compression: u32,
}

impl StreamParams {
    pub fn new(return_host: impl Into<String>) -> Self {
        Self {
            return_host: return_host.into(),
            latency_ms: DEFAULT_LATENCY_MS,
            compression: DEFAULT_COMPRESSION,
        }
    }
}

/// Requests sent host -> node on the control connection. `AttachStream` is
/// the first (and only) request on a fresh audio connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    Ping,
    UploadFactory {
        key: String,
        name: String,
        source: String,
        options: Vec<String>,
    },
    DropFactory {
        key: String,
    },
    CreateInstance {
        key: String,
        params: StreamParams,
        sample_rate: f64,
        block_size: usize,
    },
    DropInstance {
        id: u64,
    },
    AttachStream {
        id: u64,
    },
}

/// Replies sent node -> host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeReply {
    Pong,
    FactoryReady {
        key: String,
        inputs: usize,
        outputs: usize,
    },
    InstanceReady {
        id: u64,
        inputs: usize,
        outputs: usize,
        params: Vec<ParamSpec>,
    },
    Dropped,
    StreamAttached,
    Error {
        code: NodeErrorCode,
    },
}

/// One block of interleaved audio plus piggybacked parameter changes,
/// exchanged on the audio connection in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPacket {
    pub frames: u32,
    /// Interleaved samples: host->node carries the unit's inputs,
    /// node->host its outputs. Empty when the unit has no channels that way.
    pub samples: Vec<f32>,
    /// Parameter updates to apply before computing this block.
    pub params: Vec<(String, f32)>,
}
