//! Driver specific allocation side effects.
//!
//! An info provider turns a PCI address into the device nodes, mounts and the
//! environment value a container needs to use the function. Providers are
//! looked up by driver name (or by a category key such as `vdpa-client`)
//! through [`ResourceFactory::info_provider`](crate::factory::ResourceFactory::info_provider).

use std::fmt;
use std::sync::Arc;

use api_types::DeviceSpec;
use api_types::Mount;
use api_types::VdpaDeviceInfo;
use serde::Deserialize;
use tracing::warn;

use crate::inventory::HostInventory;
use crate::rdma::RdmaSpec;

const VFIO_PERMISSIONS: &str = "mrw";
const UIO_PERMISSIONS: &str = "rw";
const VFIO_CONTAINER: &str = "/dev/vfio/vfio";
const USER_VDPA_BASE: &str = "/var/run/uvdpa";
const USER_VDPA_SOCKET: &str = "vdpa.sock";
const VHOST_NET: &str = "/dev/vhost-net";
const NET_TUN: &str = "/dev/net/tun";

pub const VFIO_DRIVER: &str = "vfio-pci";
pub const UIO_DRIVERS: [&str; 3] = ["igb_uio", "uio_pci_generic", "uio"];
pub const RDMA_KEY: &str = "rdma";
pub const VDPA_CLIENT_KEY: &str = "vdpa-client";
pub const VDPA_SERVER_KEY: &str = "vdpa-server";

/// Produces allocation side effects for a PCI function.
///
/// Every method may legitimately return nothing; a missing capability is not
/// an error.
pub trait DeviceInfoProvider: Send + Sync + fmt::Debug {
    fn device_specs(&self, pci_addr: &str) -> Vec<DeviceSpec>;

    fn env_val(&self, pci_addr: &str) -> String;

    fn mounts(&self, pci_addr: &str) -> Vec<Mount>;

    /// vDPA section of the device-info document, if the provider has one.
    fn vdpa_info(&self, _pci_addr: &str) -> Option<VdpaDeviceInfo> {
        None
    }
}

/// Fallback for drivers without special needs, e.g. kernel netdev drivers.
#[derive(Debug, Default)]
pub struct GenericInfoProvider;

impl DeviceInfoProvider for GenericInfoProvider {
    fn device_specs(&self, _pci_addr: &str) -> Vec<DeviceSpec> {
        Vec::new()
    }

    fn env_val(&self, pci_addr: &str) -> String {
        pci_addr.to_string()
    }

    fn mounts(&self, _pci_addr: &str) -> Vec<Mount> {
        Vec::new()
    }
}

/// Exposes the VFIO container and the function's IOMMU group.
#[derive(Debug)]
pub struct VfioInfoProvider {
    inventory: Arc<dyn HostInventory>,
}

impl VfioInfoProvider {
    pub fn new(inventory: Arc<dyn HostInventory>) -> Self {
        Self { inventory }
    }
}

impl DeviceInfoProvider for VfioInfoProvider {
    fn device_specs(&self, pci_addr: &str) -> Vec<DeviceSpec> {
        let mut specs = vec![DeviceSpec::same_path(VFIO_CONTAINER, VFIO_PERMISSIONS)];
        match self.inventory.iommu_group(pci_addr) {
            Some(group) => specs.push(DeviceSpec::same_path(
                format!("/dev/vfio/{group}"),
                VFIO_PERMISSIONS,
            )),
            None => warn!(pci_addr, "no IOMMU group found for vfio-pci device"),
        }
        specs
    }

    fn env_val(&self, pci_addr: &str) -> String {
        pci_addr.to_string()
    }

    fn mounts(&self, _pci_addr: &str) -> Vec<Mount> {
        Vec::new()
    }
}

/// Exposes the `/dev/uioN` nodes of a UIO bound function.
#[derive(Debug)]
pub struct UioInfoProvider {
    inventory: Arc<dyn HostInventory>,
}

impl UioInfoProvider {
    pub fn new(inventory: Arc<dyn HostInventory>) -> Self {
        Self { inventory }
    }
}

impl DeviceInfoProvider for UioInfoProvider {
    fn device_specs(&self, pci_addr: &str) -> Vec<DeviceSpec> {
        let uio_devices = self.inventory.uio_devices(pci_addr);
        if uio_devices.is_empty() {
            warn!(pci_addr, "no uio device found for uio bound device");
        }
        uio_devices
            .into_iter()
            .map(|name| DeviceSpec::same_path(format!("/dev/{name}"), UIO_PERMISSIONS))
            .collect()
    }

    fn env_val(&self, pci_addr: &str) -> String {
        pci_addr.to_string()
    }

    fn mounts(&self, _pci_addr: &str) -> Vec<Mount> {
        Vec::new()
    }
}

/// Exposes the RDMA character devices of a function.
#[derive(Debug)]
pub struct RdmaInfoProvider {
    inventory: Arc<dyn HostInventory>,
}

impl RdmaInfoProvider {
    pub fn new(inventory: Arc<dyn HostInventory>) -> Self {
        Self { inventory }
    }
}

impl DeviceInfoProvider for RdmaInfoProvider {
    fn device_specs(&self, pci_addr: &str) -> Vec<DeviceSpec> {
        let spec = RdmaSpec::resolve(self.inventory.as_ref(), pci_addr);
        if !spec.is_rdma() {
            warn!(pci_addr, "RDMA resources not found, are RDMA modules loaded?");
        }
        spec.device_specs()
    }

    fn env_val(&self, pci_addr: &str) -> String {
        pci_addr.to_string()
    }

    fn mounts(&self, _pci_addr: &str) -> Vec<Mount> {
        Vec::new()
    }
}

/// User-space vDPA mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVdpaMode {
    #[display("client")]
    Client,
    #[display("server")]
    Server,
}

/// Exposes the vhost-user socket directory of a user-space vDPA device.
///
/// Client and server mode share the same socket layout.
#[derive(Debug, Default)]
pub struct UserVdpaInfoProvider;

impl UserVdpaInfoProvider {
    /// Directory holding the vhost-user socket of `pci_addr`.
    pub fn socket_dir(pci_addr: &str) -> String {
        let dir = pci_addr.replace(':', "__").replace('.', "_");
        format!("{USER_VDPA_BASE}/{dir}")
    }

    pub fn socket_path(pci_addr: &str) -> String {
        format!("{}/{USER_VDPA_SOCKET}", Self::socket_dir(pci_addr))
    }
}

impl DeviceInfoProvider for UserVdpaInfoProvider {
    fn device_specs(&self, _pci_addr: &str) -> Vec<DeviceSpec> {
        Vec::new()
    }

    fn env_val(&self, pci_addr: &str) -> String {
        Self::socket_path(pci_addr)
    }

    fn mounts(&self, pci_addr: &str) -> Vec<Mount> {
        let dir = Self::socket_dir(pci_addr);
        vec![Mount {
            container_path: dir.clone(),
            host_path: dir,
            read_only: false,
        }]
    }

    fn vdpa_info(&self, pci_addr: &str) -> Option<VdpaDeviceInfo> {
        Some(VdpaDeviceInfo {
            parent_device: pci_addr.to_string(),
            driver: "vhost".to_string(),
            path: Self::socket_path(pci_addr),
        })
    }
}

/// Device nodes needed by pools configured with `needVhostNet`.
///
/// Returns `None` when `/dev/vhost-net` is missing on the host.
pub fn vhost_net_specs(inventory: &dyn HostInventory) -> Option<Vec<DeviceSpec>> {
    if !inventory.dev_exists(VHOST_NET) {
        return None;
    }

    let mut specs = vec![DeviceSpec::same_path(VHOST_NET, VFIO_PERMISSIONS)];
    if inventory.dev_exists(NET_TUN) {
        specs.push(DeviceSpec::same_path(NET_TUN, VFIO_PERMISSIONS));
    }
    Some(specs)
}
