use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::debug;

use super::HostInventory;
use super::InventoryError;
use super::PciRecord;

const PCI_DEVICES: &str = "bus/pci/devices";
const NET_CLASS_DIR: &str = "class/net";
const DDP_TOOL: &str = "ddptool";

/// Inventory backed by sysfs, procfs and `/dev`.
///
/// The roots are configurable so a fixture tree can stand in for the host.
#[derive(Debug, Clone)]
pub struct SysfsInventory {
    sysfs_root: PathBuf,
    procfs_root: PathBuf,
    dev_root: PathBuf,
}

impl SysfsInventory {
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        procfs_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            procfs_root: procfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn device_path(&self, pci_addr: &str) -> PathBuf {
        self.sysfs_root.join(PCI_DEVICES).join(pci_addr)
    }

    fn read_record(&self, address: &str) -> Result<PciRecord, Report<InventoryError>> {
        let path = self.device_path(address);
        let hex_id = |attribute: &str| {
            read_sysfs_value(&path, attribute, address)
                .map(|value| value.trim_start_matches("0x").to_lowercase())
        };

        Ok(PciRecord {
            address: address.to_string(),
            vendor_id: hex_id("vendor")?,
            device_id: hex_id("device")?,
            class_code: read_sysfs_value(&path, "class", address)?,
            vendor_name: String::new(),
            product_name: String::new(),
        })
    }
}

impl HostInventory for SysfsInventory {
    fn pci_devices(&self) -> Result<Vec<PciRecord>, Report<InventoryError>> {
        let pci_path = self.sysfs_root.join(PCI_DEVICES);
        let entries = fs::read_dir(&pci_path).change_context(InventoryError::Unavailable {
            message: format!("cannot list {}", pci_path.display()),
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.change_context(InventoryError::Unavailable {
                message: format!("cannot list {}", pci_path.display()),
            })?;
            let address = entry.file_name().to_string_lossy().to_string();
            match self.read_record(&address) {
                Ok(record) => records.push(record),
                Err(e) => debug!(pci_addr = %address, "skipping unreadable PCI function: {e:?}"),
            }
        }

        records.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(records)
    }

    fn driver_name(&self, pci_addr: &str) -> Result<String, Report<InventoryError>> {
        read_link_name(&self.device_path(pci_addr).join("driver")).ok_or_else(|| {
            Report::new(InventoryError::NoDriver {
                pci_addr: pci_addr.to_string(),
            })
        })
    }

    fn net_names(&self, pci_addr: &str) -> Result<Vec<String>, Report<InventoryError>> {
        let net_dir = self.device_path(pci_addr).join("net");
        if !net_dir.exists() {
            return Ok(Vec::new());
        }
        list_dir_names(&net_dir).change_context(InventoryError::Attribute {
            target: pci_addr.to_string(),
            attribute: "net".to_string(),
        })
    }

    fn is_sriov_pf(&self, pci_addr: &str) -> bool {
        self.device_path(pci_addr).join("sriov_totalvfs").exists()
    }

    fn is_sriov_vf(&self, pci_addr: &str) -> bool {
        self.device_path(pci_addr).join("physfn").exists()
    }

    fn sriov_configured(&self, pci_addr: &str) -> bool {
        read_sysfs_value(&self.device_path(pci_addr), "sriov_numvfs", pci_addr)
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .is_some_and(|num_vfs| num_vfs > 0)
    }

    fn pf_address(&self, pci_addr: &str) -> Option<String> {
        read_link_name(&self.device_path(pci_addr).join("physfn"))
    }

    fn pf_name(&self, pci_addr: &str) -> Result<String, Report<InventoryError>> {
        let owner = self
            .pf_address(pci_addr)
            .unwrap_or_else(|| pci_addr.to_string());
        Ok(self.net_names(&owner)?.into_iter().next().unwrap_or_default())
    }

    fn vf_index(&self, pci_addr: &str) -> Result<Option<u32>, Report<InventoryError>> {
        let Some(pf_addr) = self.pf_address(pci_addr) else {
            return Ok(None);
        };

        let pf_path = self.device_path(&pf_addr);
        let attribute_error = || InventoryError::Attribute {
            target: pci_addr.to_string(),
            attribute: "virtfn".to_string(),
        };
        for name in list_dir_names(&pf_path).change_context_lazy(attribute_error)? {
            let Some(index) = name.strip_prefix("virtfn") else {
                continue;
            };
            if read_link_name(&pf_path.join(&name)).as_deref() == Some(pci_addr) {
                let index = index.parse::<u32>().change_context_lazy(attribute_error)?;
                return Ok(Some(index));
            }
        }

        Err(Report::new(attribute_error())
            .attach_printable(format!("no virtfn link of {pf_addr} points at {pci_addr}")))
    }

    fn numa_node(&self, pci_addr: &str) -> Option<u32> {
        read_sysfs_value(&self.device_path(pci_addr), "numa_node", pci_addr)
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(|node| u32::try_from(node).ok())
    }

    fn link_type(&self, if_name: &str) -> Result<String, Report<InventoryError>> {
        let path = self.sysfs_root.join(NET_CLASS_DIR).join(if_name);
        let value = read_sysfs_value(&path, "type", if_name)?;
        let arphrd = value.parse::<u32>().change_context(InventoryError::Malformed {
            target: if_name.to_string(),
            attribute: "type".to_string(),
            value: value.clone(),
        })?;
        Ok(encap_type(arphrd).to_string())
    }

    fn has_default_route(&self, if_name: &str) -> Result<bool, Report<InventoryError>> {
        let route_path = self.procfs_root.join("net/route");
        let table =
            fs::read_to_string(&route_path).change_context(InventoryError::Attribute {
                target: if_name.to_string(),
                attribute: route_path.display().to_string(),
            })?;
        Ok(has_default_route_entry(&table, if_name))
    }

    fn ddp_profile(&self, pci_addr: &str) -> Option<String> {
        let output = match Command::new(DDP_TOOL)
            .args(["-l", "-a", "-j", "-s", pci_addr])
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(pci_addr, status = %output.status, "ddptool reported no profile");
                return None;
            }
            Err(e) => {
                debug!(pci_addr, "ddptool unavailable: {e}");
                return None;
            }
        };
        parse_ddp_profile(&output.stdout)
    }

    fn rdma_device_name(&self, pci_addr: &str) -> Option<String> {
        list_dir_names(&self.device_path(pci_addr).join("infiniband"))
            .ok()
            .and_then(|names| names.into_iter().next())
    }

    fn rdma_char_devices(&self, pci_addr: &str) -> Vec<String> {
        let device_path = self.device_path(pci_addr);
        let patterns = [
            "infiniband_verbs/uverbs*",
            "infiniband_mad/umad*",
            "infiniband_mad/issm*",
        ];

        let mut char_devices = Vec::new();
        for pattern in patterns {
            let pattern = device_path.join(pattern);
            let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
                continue;
            };
            for path in paths.flatten() {
                if let Some(name) = path.file_name() {
                    char_devices.push(format!("/dev/infiniband/{}", name.to_string_lossy()));
                }
            }
        }

        if !char_devices.is_empty() {
            char_devices.push("/dev/infiniband/rdma_cm".to_string());
        }
        char_devices
    }

    fn iommu_group(&self, pci_addr: &str) -> Option<String> {
        read_link_name(&self.device_path(pci_addr).join("iommu_group"))
    }

    fn uio_devices(&self, pci_addr: &str) -> Vec<String> {
        list_dir_names(&self.device_path(pci_addr).join("uio")).unwrap_or_default()
    }

    fn dev_exists(&self, dev_path: &str) -> bool {
        let relative = dev_path.strip_prefix("/dev/").unwrap_or(dev_path);
        self.dev_root.join(relative).exists()
    }
}

/// Read a trimmed value from a sysfs attribute file.
fn read_sysfs_value(
    dir: &Path,
    attribute: &str,
    target: &str,
) -> Result<String, Report<InventoryError>> {
    fs::read_to_string(dir.join(attribute))
        .map(|s| s.trim().to_string())
        .change_context(InventoryError::Attribute {
            target: target.to_string(),
            attribute: attribute.to_string(),
        })
}

/// Basename of a symlink's target.
fn read_link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

fn list_dir_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
        .collect::<std::io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

/// Netlink encapsulation name of an ARPHRD hardware type.
fn encap_type(arphrd: u32) -> &'static str {
    match arphrd {
        1 => "ether",
        32 => "infiniband",
        512 => "ppp",
        768 => "ipip",
        772 => "loopback",
        776 => "sit",
        778 => "gre",
        823 => "ip6gre",
        65534 => "none",
        _ => "unknown",
    }
}

/// Whether a `/proc/net/route` table has a default route through `if_name`.
fn has_default_route_entry(table: &str, if_name: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        matches!(
            columns.as_slice(),
            [iface, destination, _gateway, _flags, _refcnt, _use, _metric, mask, ..]
                if *iface == if_name && *destination == "00000000" && *mask == "00000000"
        )
    })
}

#[derive(Debug, Deserialize)]
struct DdpInfo {
    #[serde(rename = "DDPInventory")]
    inventory: DdpInventory,
}

#[derive(Debug, Deserialize)]
struct DdpInventory {
    #[serde(rename = "DDPpackage")]
    package: DdpPackage,
}

#[derive(Debug, Deserialize)]
struct DdpPackage {
    #[serde(default)]
    name: String,
}

fn parse_ddp_profile(output: &[u8]) -> Option<String> {
    match serde_json::from_slice::<DdpInfo>(output) {
        Ok(info) if !info.inventory.package.name.is_empty() => Some(info.inventory.package.name),
        Ok(_) => None,
        Err(e) => {
            debug!("unable to decode ddptool output: {e}");
            None
        }
    }
}
