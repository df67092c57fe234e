//! Request and response payloads of the six coordinator methods.
//!
//! All types are MessagePack-encoded with field names (see
//! [`MsgPackCodec`](crate::codec::MsgPackCodec)). Responses implement
//! `Default` because the dispatch core hands the service an empty response
//! buffer to fill.

use serde::{Deserialize, Serialize};

/// One node of a computation graph.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub input: Vec<String>,
    /// Requested placement, empty for "anywhere".
    #[serde(default)]
    pub device: String,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input.push(input.into());
        self
    }
}

/// A computation graph (or a fragment appended by ExtendSession).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub node: Vec<NodeDef>,
}

/// Opaque tensor value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tensor {
    pub dtype: String,
    #[serde(default)]
    pub shape: Vec<i64>,
    #[serde(default, with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// A tensor bound to a graph endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

/// Description of one compute device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub memory_limit: u64,
    #[serde(default)]
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub graph_def: GraphDef,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_handle: String,
    pub graph_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtendSessionRequest {
    pub session_handle: String,
    #[serde(default)]
    pub graph_def: GraphDef,
    /// Version the client believes the session is at.
    pub current_graph_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtendSessionResponse {
    pub new_graph_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStepRequest {
    pub session_handle: String,
    #[serde(default)]
    pub feed: Vec<NamedTensor>,
    #[serde(default)]
    pub fetch: Vec<String>,
    #[serde(default)]
    pub target: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStepResponse {
    #[serde(default)]
    pub tensor: Vec<NamedTensor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloseSessionResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListDevicesRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListDevicesResponse {
    #[serde(default)]
    pub local_device: Vec<DeviceAttributes>,
    #[serde(default)]
    pub remote_device: Vec<DeviceAttributes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetRequest {
    /// Resource containers to clear; empty clears the default container.
    #[serde(default)]
    pub container: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetResponse {}
