use std::sync::Arc;

use error_stack::Report;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Device;
use super::DeviceKind;
use super::DeviceType;
use super::Discovery;
use super::NetAttributes;
use crate::config::DeviceConfig;
use crate::config::ResourceConfig;
use crate::factory::FactoryError;
use crate::factory::ResourceFactory;
use crate::inventory::HostInventory;
use crate::inventory::InventoryError;
use crate::inventory::PciRecord;
use crate::inventory::NETWORK_CLASS;
use crate::selectors::DeviceSelector;
use crate::selectors::RdmaSelector;
use crate::selectors::SelectorKind;

/// Resource-type tag of network functions.
pub const NET_DEVICE_TYPE: &str = "netdevice";

const VENDOR_NAME_WIDTH: usize = 20;
const PRODUCT_NAME_WIDTH: usize = 40;

/// SR-IOV capable network functions.
#[derive(Debug, Default)]
pub struct NetDeviceType;

impl DeviceType for NetDeviceType {
    fn name(&self) -> &'static str {
        NET_DEVICE_TYPE
    }

    #[tracing::instrument(skip_all, fields(records = records.len()))]
    fn discover_host_devices(
        &self,
        records: &[PciRecord],
        factory: &ResourceFactory,
    ) -> Discovery {
        let inventory = factory.inventory();
        let mut discovery = Discovery::default();

        for record in records {
            let subclass = match record.class_and_subclass() {
                Ok((class, subclass)) if class == NETWORK_CLASS => subclass,
                Ok((class, _)) => {
                    debug!(pci_addr = %record.address, %class, "skipping non-network function");
                    continue;
                }
                Err(e) => {
                    warn!(pci_addr = %record.address, "unable to parse device class: {e:?}");
                    continue;
                }
            };

            info!(
                "device found: {:<12}\t{:<12}\t{:<20}\t{:<40}",
                record.address,
                record.class_code,
                truncate(&record.vendor_name, VENDOR_NAME_WIDTH),
                truncate(&record.product_name, PRODUCT_NAME_WIDTH),
            );

            if owns_default_route(inventory, &record.address) {
                continue;
            }

            let is_pf = inventory.is_sriov_pf(&record.address);
            let is_vf = inventory.is_sriov_vf(&record.address);
            if is_pf || !is_vf {
                discovery.watch_list.push(record.address.clone());
            }
            if is_pf && inventory.sriov_configured(&record.address) {
                debug!(pci_addr = %record.address, "skipping PF with virtual functions enabled");
                continue;
            }

            match new_net_device(record, subclass, factory) {
                Ok(device) => discovery.devices.push(Arc::new(device)),
                Err(e) => error!(pci_addr = %record.address, "error adding new device: {e:?}"),
            }
        }

        discovery
    }

    fn type_selectors(
        &self,
        config: &ResourceConfig,
        factory: &ResourceFactory,
    ) -> Result<Vec<Box<dyn DeviceSelector>>, Report<FactoryError>> {
        let DeviceConfig::NetDevice(net_config) = &config.device_config else {
            return Err(Report::new(FactoryError::UnsupportedResourceType {
                resource_type: config.resource_type.clone(),
            })
            .attach_printable(format!("{} expects a netdevice configuration", config.resource_name)));
        };
        let selectors = &net_config.selectors;

        if selectors.link_types.len() > 1 {
            warn!(
                resource = %config.resource_name,
                "link type selector should have a single value"
            );
        }

        let mut stages = Vec::new();
        for (kind, values) in [
            (SelectorKind::PfNames, &selectors.pf_names),
            (SelectorKind::LinkTypes, &selectors.link_types),
            (SelectorKind::DdpProfiles, &selectors.ddp_profiles),
        ] {
            if !values.is_empty() {
                stages.push(factory.selector(kind.as_str(), values)?);
            }
        }
        if net_config.is_rdma {
            stages.push(Box::new(RdmaSelector) as Box<dyn DeviceSelector>);
        }

        Ok(stages)
    }
}

/// Whether any interface of the function carries the default route. Route
/// lookup failures count as "no".
fn owns_default_route(inventory: &dyn HostInventory, pci_addr: &str) -> bool {
    let if_names = match inventory.net_names(pci_addr) {
        Ok(names) => names,
        Err(e) => {
            warn!(pci_addr, "unable to list interfaces: {e:?}");
            return false;
        }
    };

    for if_name in if_names {
        match inventory.has_default_route(&if_name) {
            Ok(true) => {
                info!(pci_addr, %if_name, "excluding interface, default route found");
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(pci_addr, %if_name, "unable to read routes: {e:?}"),
        }
    }
    false
}

fn new_net_device(
    record: &PciRecord,
    subclass: String,
    factory: &ResourceFactory,
) -> Result<Device, Report<InventoryError>> {
    let inventory = factory.inventory();
    let pci_addr = record.address.as_str();

    let driver = inventory.driver_name(pci_addr)?;
    let if_name = inventory
        .net_names(pci_addr)
        .ok()
        .and_then(|names| names.into_iter().next())
        .unwrap_or_default();
    let pf_name = inventory.pf_name(pci_addr).unwrap_or_else(|e| {
        warn!(pci_addr, "unable to get PF name: {e:?}");
        String::new()
    });
    let vf_index = inventory.vf_index(pci_addr)?;
    let link_type = if if_name.is_empty() {
        String::new()
    } else {
        inventory.link_type(&if_name)?
    };

    let numa_node = inventory.numa_node(pci_addr);
    if numa_node.is_none() {
        debug!(pci_addr, "NUMA node unknown");
    }
    let rdma = factory.rdma_spec(pci_addr);
    if !rdma.is_rdma() {
        debug!(pci_addr, "no RDMA resources");
    }

    let provider = factory.info_provider(&driver);

    Ok(Device {
        pci_addr: pci_addr.to_string(),
        vendor: record.vendor_id.clone(),
        device_code: record.device_id.clone(),
        subclass,
        pf_addr: inventory.pf_address(pci_addr),
        vf_index,
        numa_node,
        if_name,
        device_specs: provider.device_specs(pci_addr),
        mounts: provider.mounts(pci_addr),
        env: provider.env_val(pci_addr),
        driver,
        kind: DeviceKind::Net(NetAttributes {
            pf_name,
            link_type,
            rdma,
        }),
    })
}

/// Shorten `name` to `width` characters, marking the cut with "...".
fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let kept: String = name.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}
