//! Device selectors and the per-pool selector pipeline.
//!
//! Every selector is a predicate over [`Device`]; filtering keeps the input
//! order and never adds devices. A pipeline runs the generic vendor, device
//! and driver stages first, then the stages contributed by the device type.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use error_stack::Report;
use tracing::debug;
use tracing::warn;

use crate::config::ResourceConfig;
use crate::devices::Device;
use crate::factory::FactoryError;
use crate::factory::ResourceFactory;
use crate::inventory::HostInventory;

/// A named predicate narrowing a device set.
pub trait DeviceSelector: Send + Sync + fmt::Debug {
    fn matches(&self, device: &Device) -> bool;

    fn filter(&self, devices: &[Arc<Device>]) -> Vec<Arc<Device>> {
        devices
            .iter()
            .filter(|device| self.matches(device))
            .cloned()
            .collect()
    }
}

/// Selector names accepted in a pool's `selectors` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Vendors,
    Devices,
    Drivers,
    PfNames,
    LinkTypes,
    DdpProfiles,
}

impl SelectorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vendors" => Some(Self::Vendors),
            "devices" => Some(Self::Devices),
            "drivers" => Some(Self::Drivers),
            "pfNames" => Some(Self::PfNames),
            "linkTypes" => Some(Self::LinkTypes),
            "ddpProfiles" => Some(Self::DdpProfiles),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vendors => "vendors",
            Self::Devices => "devices",
            Self::Drivers => "drivers",
            Self::PfNames => "pfNames",
            Self::LinkTypes => "linkTypes",
            Self::DdpProfiles => "ddpProfiles",
        }
    }

    /// Selector for `values`. The inventory is consulted by selectors that
    /// look up host state at filter time.
    pub fn build(
        self,
        values: &[String],
        inventory: &Arc<dyn HostInventory>,
    ) -> Box<dyn DeviceSelector> {
        let set = || values.iter().cloned().collect::<BTreeSet<_>>();
        match self {
            Self::Vendors => Box::new(VendorSelector(set())),
            Self::Devices => Box::new(DeviceCodeSelector(set())),
            Self::Drivers => Box::new(DriverSelector(set())),
            Self::PfNames => Box::new(PfNameSelector::new(values)),
            Self::LinkTypes => Box::new(LinkTypeSelector(set())),
            Self::DdpProfiles => Box::new(DdpSelector::new(set(), inventory.clone())),
        }
    }
}

#[derive(Debug)]
pub struct VendorSelector(BTreeSet<String>);

impl DeviceSelector for VendorSelector {
    fn matches(&self, device: &Device) -> bool {
        self.0.contains(&device.vendor)
    }
}

#[derive(Debug)]
pub struct DeviceCodeSelector(BTreeSet<String>);

impl DeviceSelector for DeviceCodeSelector {
    fn matches(&self, device: &Device) -> bool {
        self.0.contains(&device.device_code)
    }
}

#[derive(Debug)]
pub struct DriverSelector(BTreeSet<String>);

impl DeviceSelector for DriverSelector {
    fn matches(&self, device: &Device) -> bool {
        self.0.contains(&device.driver)
    }
}

#[derive(Debug)]
pub struct LinkTypeSelector(BTreeSet<String>);

impl DeviceSelector for LinkTypeSelector {
    fn matches(&self, device: &Device) -> bool {
        device
            .as_net()
            .is_some_and(|net| self.0.contains(&net.link_type))
    }
}

/// Matches devices with a loaded DDP profile from the set. Devices without a
/// profile never match.
///
/// Profiles are read from the host when the selector runs, so only pools
/// configured with `ddpProfiles` pay for the lookup.
pub struct DdpSelector {
    profiles: BTreeSet<String>,
    inventory: Arc<dyn HostInventory>,
}

impl DdpSelector {
    pub fn new(profiles: BTreeSet<String>, inventory: Arc<dyn HostInventory>) -> Self {
        Self {
            profiles,
            inventory,
        }
    }
}

impl fmt::Debug for DdpSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DdpSelector").field(&self.profiles).finish()
    }
}

impl DeviceSelector for DdpSelector {
    fn matches(&self, device: &Device) -> bool {
        if device.as_net().is_none() {
            return false;
        }
        self.inventory
            .ddp_profile(&device.pci_addr)
            .is_some_and(|profile| !profile.is_empty() && self.profiles.contains(&profile))
    }
}

/// Keeps only RDMA capable devices.
#[derive(Debug)]
pub struct RdmaSelector;

impl DeviceSelector for RdmaSelector {
    fn matches(&self, device: &Device) -> bool {
        device.as_net().is_some_and(|net| net.rdma.is_rdma())
    }
}

/// Inclusive range of VF indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VfRange {
    start: u32,
    end: u32,
}

impl VfRange {
    fn contains(&self, index: u32) -> bool {
        (self.start..=self.end).contains(&index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PfNameEntry {
    pf_name: String,
    /// `None` selects every function of the PF
    ranges: Option<Vec<VfRange>>,
}

/// Matches by the owning PF's interface name, optionally restricted to VF
/// indices: `netpf0`, `netpf0#3`, `netpf0#0-2,7`.
#[derive(Debug)]
pub struct PfNameSelector {
    entries: Vec<PfNameEntry>,
}

impl PfNameSelector {
    pub fn new(values: &[String]) -> Self {
        Self {
            entries: values.iter().filter_map(|v| parse_pf_name_entry(v)).collect(),
        }
    }
}

impl DeviceSelector for PfNameSelector {
    fn matches(&self, device: &Device) -> bool {
        let Some(net) = device.as_net() else {
            return false;
        };

        // Entries naming the same PF add up.
        self.entries
            .iter()
            .filter(|entry| entry.pf_name == net.pf_name)
            .any(|entry| match (&entry.ranges, device.vf_index) {
                (None, _) => true,
                (Some(ranges), Some(index)) => ranges.iter().any(|range| range.contains(index)),
                (Some(_), None) => false,
            })
    }
}

fn parse_pf_name_entry(value: &str) -> Option<PfNameEntry> {
    let Some((pf_name, ranges)) = value.split_once('#') else {
        return Some(PfNameEntry {
            pf_name: value.to_string(),
            ranges: None,
        });
    };
    if ranges.contains('#') {
        warn!(selector = value, "failed to parse PF name selector, unexpected separator");
        return None;
    }

    let ranges = ranges
        .split(',')
        .filter_map(|token| match parse_vf_range(token) {
            Some(range) => Some(range),
            None => {
                warn!(selector = value, token, "skipping malformed VF index or range");
                None
            }
        })
        .collect();

    Some(PfNameEntry {
        pf_name: pf_name.to_string(),
        ranges: Some(ranges),
    })
}

fn parse_vf_range(token: &str) -> Option<VfRange> {
    let token = token.trim();
    match token.split_once('-') {
        Some((start, end)) => {
            let start = start.parse().ok()?;
            let end = end.parse().ok()?;
            Some(VfRange { start, end })
        }
        None => {
            let index = token.parse().ok()?;
            Some(VfRange {
                start: index,
                end: index,
            })
        }
    }
}

/// Ordered selector stages of one pool.
#[derive(Debug, Default)]
pub struct SelectorPipeline {
    stages: Vec<Box<dyn DeviceSelector>>,
}

impl SelectorPipeline {
    pub fn new(stages: Vec<Box<dyn DeviceSelector>>) -> Self {
        Self { stages }
    }

    /// Stages for `config`: vendors, devices, drivers, then the device type's
    /// own selectors. Empty selector lists add no stage.
    pub fn for_config(
        config: &ResourceConfig,
        factory: &ResourceFactory,
    ) -> Result<Self, Report<FactoryError>> {
        let mut stages = Vec::new();
        if let Some(common) = config.common_selectors() {
            for (kind, values) in [
                (SelectorKind::Vendors, &common.vendors),
                (SelectorKind::Devices, &common.devices),
                (SelectorKind::Drivers, &common.drivers),
            ] {
                if !values.is_empty() {
                    stages.push(factory.selector(kind.as_str(), values)?);
                }
            }
        }

        let device_type = factory.device_type(&config.resource_type)?;
        stages.extend(device_type.type_selectors(config, factory)?);
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn filter(&self, devices: &[Arc<Device>]) -> Vec<Arc<Device>> {
        let mut remaining = devices.to_vec();
        for stage in &self.stages {
            remaining = stage.filter(&remaining);
            debug!(?stage, remaining = remaining.len(), "selector stage applied");
        }
        remaining
    }
}
