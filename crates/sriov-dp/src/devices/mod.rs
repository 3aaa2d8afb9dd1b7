//! Typed devices and the device-type seam.
//!
//! A [`DeviceType`] classifies raw PCI records into [`Device`]s and supplies
//! the selectors specific to its kind. Type-specific attributes travel in
//! [`DeviceKind`] so callers match on the variant instead of downcasting.

pub mod net;

use std::fmt;
use std::sync::Arc;

use api_types::DeviceSpec;
use api_types::Mount;
use error_stack::Report;

use crate::config::ResourceConfig;
use crate::factory::FactoryError;
use crate::factory::ResourceFactory;
use crate::inventory::PciRecord;
use crate::rdma::RdmaSpec;
use crate::selectors::DeviceSelector;

pub use net::NetDeviceType;

/// One classified PCI function. Immutable once built; shared as `Arc<Device>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub pci_addr: String,
    pub vendor: String,
    pub device_code: String,
    pub subclass: String,
    pub driver: String,
    /// Owning PF address, `None` when the function is not a VF
    pub pf_addr: Option<String>,
    pub vf_index: Option<u32>,
    pub numa_node: Option<u32>,
    /// First network interface name, empty when the function has none
    pub if_name: String,
    pub device_specs: Vec<DeviceSpec>,
    pub mounts: Vec<Mount>,
    pub env: String,
    pub kind: DeviceKind,
}

impl Device {
    /// Network attributes, `None` for other device kinds.
    pub fn as_net(&self) -> Option<&NetAttributes> {
        match &self.kind {
            DeviceKind::Net(attributes) => Some(attributes),
        }
    }

    /// Orchestrator-facing record of this device.
    pub fn api_device(&self) -> api_types::Device {
        api_types::Device::healthy(self.pci_addr.clone(), self.numa_node)
    }
}

/// Type-specific payload of a [`Device`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    Net(NetAttributes),
}

/// Attributes of a network function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetAttributes {
    /// Interface name of the owning PF (or of the function itself for non-VFs)
    pub pf_name: String,
    /// Link encapsulation, e.g. "ether"; empty without an interface
    pub link_type: String,
    pub rdma: RdmaSpec,
}

/// Result of classifying the host inventory for one device type.
#[derive(Debug, Default)]
pub struct Discovery {
    pub devices: Vec<Arc<Device>>,
    /// PCI addresses whose link status should be followed
    pub watch_list: Vec<String>,
}

/// Behaviour bound to one resource-type tag.
pub trait DeviceType: Send + Sync + fmt::Debug {
    /// Tag used in the `resourceType` configuration field.
    fn name(&self) -> &'static str;

    /// Turn raw PCI records into devices of this type.
    ///
    /// Functions that fail classification are dropped with a log line; the
    /// scan itself never fails.
    fn discover_host_devices(&self, records: &[PciRecord], factory: &ResourceFactory)
        -> Discovery;

    /// Selectors run after the generic vendor/device/driver stages, in
    /// execution order.
    fn type_selectors(
        &self,
        config: &ResourceConfig,
        factory: &ResourceFactory,
    ) -> Result<Vec<Box<dyn DeviceSelector>>, Report<FactoryError>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Network device with no side effects, for selector and pool tests.
    pub(crate) fn net_device(pci_addr: &str, vendor: &str, device_code: &str, driver: &str) -> Device {
        Device {
            pci_addr: pci_addr.to_string(),
            vendor: vendor.to_string(),
            device_code: device_code.to_string(),
            subclass: "00".to_string(),
            driver: driver.to_string(),
            pf_addr: None,
            vf_index: None,
            numa_node: None,
            if_name: String::new(),
            device_specs: Vec::new(),
            mounts: Vec::new(),
            env: pci_addr.to_string(),
            kind: DeviceKind::Net(NetAttributes::default()),
        }
    }

    /// VF `index` of the PF named `pf_name`.
    pub(crate) fn vf(pci_addr: &str, pf_name: &str, index: u32) -> Device {
        let mut device = net_device(pci_addr, "8086", "154c", "iavf");
        device.pf_addr = Some(format!("pf-of-{pf_name}"));
        device.vf_index = Some(index);
        device.kind = DeviceKind::Net(NetAttributes {
            pf_name: pf_name.to_string(),
            link_type: "ether".to_string(),
            ..NetAttributes::default()
        });
        device
    }

    pub(crate) fn with_net(mut device: Device, update: impl FnOnce(&mut NetAttributes)) -> Device {
        let DeviceKind::Net(attributes) = &mut device.kind;
        update(attributes);
        device
    }
}
