//! Line-delimited JSON protocol spoken on a pool's socket.
//!
//! Each request is one JSON object on its own line, tagged by `method`; each
//! answer is one JSON line holding the response record or `{"error": ...}`.

use api_types::AllocateResponse;
use api_types::ContainerAllocateRequest;
use api_types::DevicePluginOptions;
use api_types::ListAndWatchResponse;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum PluginRequest {
    GetDevicePluginOptions,
    ListAndWatch,
    Allocate {
        #[serde(rename = "containerRequests")]
        container_requests: Vec<ContainerAllocateRequest>,
    },
    PreStartContainer {
        #[serde(rename = "devicesIds", default)]
        devices_ids: Vec<String>,
    },
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PluginResponse {
    Options(DevicePluginOptions),
    Devices(ListAndWatchResponse),
    Allocate(AllocateResponse),
    PreStartContainer(Empty),
    Error { error: String },
}

impl PluginResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}
