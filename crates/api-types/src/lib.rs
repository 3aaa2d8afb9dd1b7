//! Shared API type definitions
//!
//! This crate contains the device-plugin records exchanged between resource
//! pools, the per-pool protocol adapters and the orchestrator, together with
//! the network-attachment device-info document persisted at allocation time.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Health value reported for a device that can be allocated.
pub const HEALTHY: &str = "Healthy";

/// NUMA node a device is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: i64,
}

/// Topology hints published with a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TopologyInfo {
    pub nodes: Vec<NumaNode>,
}

/// One allocatable device as listed to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device id, the PCI address for network functions
    pub id: String,
    pub health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyInfo>,
}

impl Device {
    /// Create a healthy device, attaching a NUMA hint when the node is known.
    pub fn healthy(id: impl Into<String>, numa_node: Option<u32>) -> Self {
        Self {
            id: id.into(),
            health: HEALTHY.to_string(),
            topology: numa_node.map(|node| TopologyInfo {
                nodes: vec![NumaNode { id: i64::from(node) }],
            }),
        }
    }
}

/// Host device node exposed inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

impl DeviceSpec {
    /// Spec exposing `path` at the same location inside the container.
    pub fn same_path(path: impl Into<String>, permissions: &str) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: permissions.to_string(),
        }
    }
}

/// Host path bind-mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

/// Options advertised by a device plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginOptions {
    pub pre_start_required: bool,
    pub get_preferred_allocation_available: bool,
}

/// Full device list of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListAndWatchResponse {
    pub devices: Vec<Device>,
}

/// Devices requested for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateRequest {
    pub devices_ids: Vec<String>,
}

/// Side effects granted to one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerAllocateResponse {
    pub envs: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceSpec>,
    pub annotations: BTreeMap<String, String>,
}

/// Allocation answer, one entry per container request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}

/// PCI section of a device-info document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PciDeviceInfo {
    pub pci_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pf_pci_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rdma_device: String,
}

/// vDPA section of a device-info document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VdpaDeviceInfo {
    pub parent_device: String,
    pub driver: String,
    pub path: String,
}

/// Network-attachment device-info document written per allocated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci: Option<PciDeviceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdpa: Option<VdpaDeviceInfo>,
}

impl DeviceInfo {
    pub const VERSION: &'static str = "1.0.0";
    pub const TYPE_PCI: &'static str = "pci";
    pub const TYPE_VDPA: &'static str = "vdpa";
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn device_with_numa_node_carries_topology() {
        let device = Device::healthy("0000:3b:02.0", Some(1));

        assert_eq!(device.health, HEALTHY);
        assert_eq!(
            device.topology,
            Some(TopologyInfo {
                nodes: vec![NumaNode { id: 1 }]
            })
        );
        assert_eq!(Device::healthy("0000:3b:02.1", None).topology, None);
    }

    #[test]
    fn device_info_uses_network_attachment_keys() {
        let info = DeviceInfo {
            kind: DeviceInfo::TYPE_PCI.to_string(),
            version: DeviceInfo::VERSION.to_string(),
            pci: Some(PciDeviceInfo {
                pci_address: "0000:3b:02.0".to_string(),
                pf_pci_address: "0000:3b:00.0".to_string(),
                rdma_device: String::new(),
            }),
            vdpa: None,
        };

        let json = serde_json::to_string(&info).expect("should serialize device info");

        assert_eq!(
            json,
            r#"{"type":"pci","version":"1.0.0","pci":{"pci-address":"0000:3b:02.0","pf-pci-address":"0000:3b:00.0"}}"#
        );
    }
}
