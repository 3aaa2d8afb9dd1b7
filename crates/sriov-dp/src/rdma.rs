//! RDMA capability of a PCI function.

use api_types::DeviceSpec;

use crate::inventory::HostInventory;

/// Permissions granted on RDMA character devices.
const RDMA_PERMISSIONS: &str = "rwm";

/// RDMA resources backing one PCI function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdmaSpec {
    device_name: Option<String>,
    char_devices: Vec<String>,
}

impl RdmaSpec {
    /// Resolve the RDMA resources of `pci_addr`. A function without RDMA
    /// support yields an empty spec.
    pub fn resolve(inventory: &dyn HostInventory, pci_addr: &str) -> Self {
        Self {
            device_name: inventory.rdma_device_name(pci_addr),
            char_devices: inventory.rdma_char_devices(pci_addr),
        }
    }

    pub fn is_rdma(&self) -> bool {
        !self.char_devices.is_empty()
    }

    /// Name of the RDMA device, e.g. "mlx5_0".
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.char_devices
            .iter()
            .map(|path| DeviceSpec::same_path(path.as_str(), RDMA_PERMISSIONS))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::inventory::fake::FakeFunction;
    use crate::inventory::fake::FakeInventory;

    #[test]
    fn function_without_char_devices_is_not_rdma() {
        let inventory = FakeInventory::with([FakeFunction::net(
            "0000:3b:02.0",
            "8086",
            "154c",
            "iavf",
        )]);

        let spec = RdmaSpec::resolve(&inventory, "0000:3b:02.0");

        assert!(!spec.is_rdma());
        assert!(spec.device_specs().is_empty());
        assert_eq!(spec.device_name(), None);
    }

    #[test]
    fn char_devices_become_device_specs() {
        let mut function = FakeFunction::net("0000:5e:00.2", "15b3", "1018", "mlx5_core");
        function.rdma_device = Some("mlx5_2".to_string());
        function.rdma_char_devices = vec![
            "/dev/infiniband/uverbs2".to_string(),
            "/dev/infiniband/rdma_cm".to_string(),
        ];
        let inventory = FakeInventory::with([function]);

        let spec = RdmaSpec::resolve(&inventory, "0000:5e:00.2");

        assert!(spec.is_rdma());
        assert_eq!(spec.device_name(), Some("mlx5_2"));
        assert_eq!(
            spec.device_specs(),
            vec![
                DeviceSpec::same_path("/dev/infiniband/uverbs2", "rwm"),
                DeviceSpec::same_path("/dev/infiniband/rdma_cm", "rwm"),
            ]
        );
    }
}
