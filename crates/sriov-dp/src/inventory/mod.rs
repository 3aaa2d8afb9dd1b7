//! Host inventory source.
//!
//! Everything the discovery pipeline knows about the host comes through the
//! [`HostInventory`] trait: raw PCI records, driver bindings, SR-IOV topology,
//! link attributes and side-channel device nodes. [`SysfsInventory`] reads
//! them from sysfs/procfs; tests substitute an in-memory double.

mod sysfs;

use std::fmt;

use error_stack::Report;
use thiserror::Error;

pub use sysfs::SysfsInventory;

/// PCI class code of network controllers.
pub const NETWORK_CLASS: &str = "02";

/// Errors raised while reading host inventory.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("PCI inventory is unavailable: {message}")]
    Unavailable { message: String },
    #[error("Failed to read {attribute} of {target}")]
    Attribute { target: String, attribute: String },
    #[error("No driver is bound to {pci_addr}")]
    NoDriver { pci_addr: String },
    #[error("Malformed value `{value}` for {attribute} of {target}")]
    Malformed {
        target: String,
        attribute: String,
        value: String,
    },
}

/// One raw PCI function as enumerated on the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PciRecord {
    /// PCI address, e.g. "0000:3b:02.0"
    pub address: String,
    /// Vendor ID without the `0x` prefix, e.g. "8086"
    pub vendor_id: String,
    /// Device ID without the `0x` prefix, e.g. "154c"
    pub device_id: String,
    /// Raw class code as published by the kernel, e.g. "0x020000"
    pub class_code: String,
    /// Human readable vendor name, empty when unknown
    pub vendor_name: String,
    /// Human readable product name, empty when unknown
    pub product_name: String,
}

impl PciRecord {
    /// Splits the class code into its (class, subclass) hex pairs.
    pub fn class_and_subclass(&self) -> Result<(String, String), Report<InventoryError>> {
        let raw = self.class_code.trim();
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        let malformed = || {
            Report::new(InventoryError::Malformed {
                target: self.address.clone(),
                attribute: "class".to_string(),
                value: self.class_code.clone(),
            })
        };

        if digits.len() < 4 || u32::from_str_radix(digits, 16).is_err() {
            return Err(malformed());
        }
        Ok((digits[0..2].to_lowercase(), digits[2..4].to_lowercase()))
    }
}

/// Read-only view of the host's PCI and network state.
///
/// All methods are bounded local reads. Methods returning plain values
/// degrade to "absent" instead of failing, because absence of a capability is
/// not an error for the callers.
pub trait HostInventory: Send + Sync + fmt::Debug {
    /// Every PCI function on the host.
    fn pci_devices(&self) -> Result<Vec<PciRecord>, Report<InventoryError>>;

    /// Kernel driver currently bound to the function.
    fn driver_name(&self, pci_addr: &str) -> Result<String, Report<InventoryError>>;

    /// Network interface names backed by the function.
    fn net_names(&self, pci_addr: &str) -> Result<Vec<String>, Report<InventoryError>>;

    /// Whether the function is an SR-IOV capable physical function.
    fn is_sriov_pf(&self, pci_addr: &str) -> bool;

    /// Whether the function is an SR-IOV virtual function.
    fn is_sriov_vf(&self, pci_addr: &str) -> bool;

    /// Whether the physical function currently has virtual functions enabled.
    fn sriov_configured(&self, pci_addr: &str) -> bool;

    /// Address of the owning physical function, `None` for non-VFs.
    fn pf_address(&self, pci_addr: &str) -> Option<String>;

    /// Published interface name of the owning physical function. For a
    /// function that is not a VF this is its own first interface name.
    fn pf_name(&self, pci_addr: &str) -> Result<String, Report<InventoryError>>;

    /// Index of the VF on its PF, `None` for non-VFs.
    fn vf_index(&self, pci_addr: &str) -> Result<Option<u32>, Report<InventoryError>>;

    /// NUMA node of the function, `None` when unknown.
    fn numa_node(&self, pci_addr: &str) -> Option<u32>;

    /// Link encapsulation type of an interface, e.g. "ether".
    fn link_type(&self, if_name: &str) -> Result<String, Report<InventoryError>>;

    /// Whether the interface carries the host's IPv4 default route.
    fn has_default_route(&self, if_name: &str) -> Result<bool, Report<InventoryError>>;

    /// Loaded DDP profile name, `None` when the adapter reports none.
    fn ddp_profile(&self, pci_addr: &str) -> Option<String>;

    /// RDMA device name (e.g. "mlx5_0") bound to the function.
    fn rdma_device_name(&self, pci_addr: &str) -> Option<String>;

    /// RDMA character device paths of the function.
    fn rdma_char_devices(&self, pci_addr: &str) -> Vec<String>;

    /// IOMMU group of the function.
    fn iommu_group(&self, pci_addr: &str) -> Option<String>;

    /// UIO device names (e.g. "uio0") of the function.
    fn uio_devices(&self, pci_addr: &str) -> Vec<String>;

    /// Whether a host device node such as "/dev/vhost-net" exists.
    fn dev_exists(&self, dev_path: &str) -> bool;
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn record(class_code: &str) -> PciRecord {
        PciRecord {
            address: "0000:3b:00.0".to_string(),
            class_code: class_code.to_string(),
            ..PciRecord::default()
        }
    }

    #[test]
    fn class_code_splits_into_class_and_subclass() {
        let (class, subclass) = record("0x020000")
            .class_and_subclass()
            .expect("should parse network class");
        assert_eq!(class, NETWORK_CLASS);
        assert_eq!(subclass, "00");

        let (class, subclass) = record("0x0207")
            .class_and_subclass()
            .expect("should parse short class code");
        assert_eq!(class, "02");
        assert_eq!(subclass, "07");
    }

    #[test]
    fn malformed_class_code_is_rejected() {
        assert!(record("network").class_and_subclass().is_err());
        assert!(record("0x2").class_and_subclass().is_err());
    }
}
