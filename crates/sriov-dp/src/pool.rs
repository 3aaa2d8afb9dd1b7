//! Resource pools.
//!
//! A pool is the frozen result of running one configuration's selectors over
//! the discovered devices. It answers allocation queries and never changes
//! after construction.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use api_types::DeviceInfo;
use api_types::DeviceSpec;
use api_types::Mount;
use api_types::PciDeviceInfo;
use api_types::VdpaDeviceInfo;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::NetDeviceConfig;
use crate::config::ResourceConfig;
use crate::devices::Device;
use crate::factory::ResourceFactory;
use crate::info_provider::vhost_net_specs;
use crate::inventory::HostInventory;

/// Allocatable view of one pool.
pub trait ResourcePool: Send + Sync + fmt::Debug {
    fn resource_name(&self) -> &str;

    fn resource_prefix(&self) -> &str;

    /// Orchestrator-facing devices keyed by id.
    fn devices(&self) -> &BTreeMap<String, api_types::Device>;

    /// Device nodes of the known `ids`, unique by host path. The first
    /// occurrence of a host path wins.
    fn device_specs(&self, ids: &[String]) -> Vec<DeviceSpec>;

    /// One environment value per known id, in request order.
    fn envs(&self, ids: &[String]) -> Vec<String>;

    fn mounts(&self, ids: &[String]) -> Vec<Mount>;

    /// Device-info document of an allocated device.
    fn device_info(&self, id: &str) -> Option<DeviceInfo>;

    /// Re-check device health, returning true when any device changed.
    ///
    /// Health is static for pools built from sysfs.
    fn probe(&self) -> bool {
        false
    }
}

/// Push every spec whose host path is not yet present.
pub fn extend_unique(specs: &mut Vec<DeviceSpec>, new_specs: impl IntoIterator<Item = DeviceSpec>) {
    let mut seen: BTreeSet<String> = specs.iter().map(|s| s.host_path.clone()).collect();
    for spec in new_specs {
        if seen.insert(spec.host_path.clone()) {
            specs.push(spec);
        }
    }
}

/// A device as frozen into a pool, with its resolved side effects.
#[derive(Debug)]
struct PoolDevice {
    device: Arc<Device>,
    env: String,
    specs: Vec<DeviceSpec>,
    mounts: Vec<Mount>,
    rdma_device: Option<String>,
    vdpa: Option<VdpaDeviceInfo>,
}

/// Pool of network functions.
pub struct NetResourcePool {
    resource_name: String,
    resource_prefix: String,
    need_vhost_net: bool,
    inventory: Arc<dyn HostInventory>,
    api_devices: BTreeMap<String, api_types::Device>,
    pool: BTreeMap<String, PoolDevice>,
}

impl fmt::Debug for NetResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetResourcePool")
            .field("resource_name", &self.resource_name)
            .field("resource_prefix", &self.resource_prefix)
            .field("devices", &self.api_devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NetResourcePool {
    /// Freeze `devices` for `config`.
    ///
    /// With `vdpaType` set, side effects come from the user vDPA provider
    /// instead of the device's driver. With `isRdma` set, devices without RDMA
    /// resources are left out and RDMA character devices are added to the
    /// rest.
    pub fn build(
        config: &ResourceConfig,
        net_config: &NetDeviceConfig,
        devices: &[Arc<Device>],
        factory: &ResourceFactory,
    ) -> Self {
        let resource_prefix = config
            .prefix(&factory.settings().resource_prefix)
            .to_string();
        let vdpa_provider = net_config
            .vdpa_type
            .map(|mode| factory.info_provider(&format!("vdpa-{mode}")));

        let mut api_devices = BTreeMap::new();
        let mut pool = BTreeMap::new();
        for device in devices {
            let addr = device.pci_addr.as_str();
            let rdma = device.as_net().map(|net| &net.rdma);

            let (env, mut specs, mounts, vdpa) = match &vdpa_provider {
                Some(provider) => (
                    provider.env_val(addr),
                    provider.device_specs(addr),
                    provider.mounts(addr),
                    provider.vdpa_info(addr),
                ),
                None => (
                    device.env.clone(),
                    device.device_specs.clone(),
                    device.mounts.clone(),
                    None,
                ),
            };

            let mut rdma_device = None;
            if net_config.is_rdma {
                match rdma.filter(|spec| spec.is_rdma()) {
                    Some(spec) => {
                        extend_unique(&mut specs, spec.device_specs());
                        rdma_device = spec.device_name().map(str::to_string);
                    }
                    None => {
                        warn!(
                            resource = %config.resource_name,
                            pci_addr = addr,
                            "rdma is required but the device is not an rdma device, excluding it"
                        );
                        continue;
                    }
                }
            }

            api_devices.insert(device.pci_addr.clone(), device.api_device());
            pool.insert(
                device.pci_addr.clone(),
                PoolDevice {
                    device: device.clone(),
                    env,
                    specs,
                    mounts,
                    rdma_device,
                    vdpa,
                },
            );
        }

        info!(
            resource = %config.resource_name,
            prefix = %resource_prefix,
            devices = pool.len(),
            "resource pool built"
        );

        Self {
            resource_name: config.resource_name.clone(),
            resource_prefix,
            need_vhost_net: net_config.need_vhost_net,
            inventory: factory.inventory_handle(),
            api_devices,
            pool,
        }
    }

    fn known<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = &'a PoolDevice> + 'a {
        ids.iter().filter_map(|id| self.pool.get(id))
    }
}

impl ResourcePool for NetResourcePool {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn resource_prefix(&self) -> &str {
        &self.resource_prefix
    }

    fn devices(&self) -> &BTreeMap<String, api_types::Device> {
        &self.api_devices
    }

    fn device_specs(&self, ids: &[String]) -> Vec<DeviceSpec> {
        let vhost_net = if self.need_vhost_net {
            let specs = vhost_net_specs(self.inventory.as_ref());
            if specs.is_none() {
                error!(
                    resource = %self.resource_name,
                    "vhost-net is required in the configuration but /dev/vhost-net doesn't exist"
                );
            }
            specs
        } else {
            None
        };

        let mut specs = Vec::new();
        for pool_device in self.known(ids) {
            extend_unique(&mut specs, pool_device.specs.iter().cloned());
            if let Some(vhost_net) = &vhost_net {
                extend_unique(&mut specs, vhost_net.iter().cloned());
            }
        }
        specs
    }

    fn envs(&self, ids: &[String]) -> Vec<String> {
        self.known(ids).map(|d| d.env.clone()).collect()
    }

    fn mounts(&self, ids: &[String]) -> Vec<Mount> {
        self.known(ids).flat_map(|d| d.mounts.iter().cloned()).collect()
    }

    fn device_info(&self, id: &str) -> Option<DeviceInfo> {
        let pool_device = self.pool.get(id)?;
        let pci = PciDeviceInfo {
            pci_address: pool_device.device.pci_addr.clone(),
            pf_pci_address: pool_device.device.pf_addr.clone().unwrap_or_default(),
            rdma_device: pool_device.rdma_device.clone().unwrap_or_default(),
        };
        let kind = if pool_device.vdpa.is_some() {
            DeviceInfo::TYPE_VDPA
        } else {
            DeviceInfo::TYPE_PCI
        };

        Some(DeviceInfo {
            kind: kind.to_string(),
            version: DeviceInfo::VERSION.to_string(),
            pci: Some(pci),
            vdpa: pool_device.vdpa.clone(),
        })
    }
}
