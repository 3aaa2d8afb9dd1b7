use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::devices::net::NET_DEVICE_TYPE;
use crate::info_provider::UserVdpaMode;

static RESOURCE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.]+$").expect("resource name pattern is a valid regex")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read { path: String },
    #[error("Failed to parse resource config")]
    Parse,
    #[error("Invalid resource name: {name}")]
    InvalidName { name: String },
    #[error("Duplicate resource name: {name}")]
    DuplicateName { name: String },
}

/// Vendor, device code and driver lists shared by every device type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonSelectors {
    #[serde(default)]
    pub vendors: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub drivers: Vec<String>,
}

/// Selector block of a `netdevice` pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetDeviceSelectors {
    #[serde(flatten)]
    pub common: CommonSelectors,
    #[serde(default)]
    pub pf_names: Vec<String>,
    #[serde(default)]
    pub link_types: Vec<String>,
    #[serde(default)]
    pub ddp_profiles: Vec<String>,
}

/// Type-specific payload of a `netdevice` pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetDeviceConfig {
    #[serde(default)]
    pub is_rdma: bool,
    #[serde(default)]
    pub need_vhost_net: bool,
    /// Serve the functions as user-space vDPA devices in this mode
    #[serde(default)]
    pub vdpa_type: Option<UserVdpaMode>,
    #[serde(default)]
    pub selectors: NetDeviceSelectors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConfig {
    NetDevice(NetDeviceConfig),
    /// A resource type without a known payload
    Unknown,
}

/// Fields every resource block carries.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonResourceConfig {
    #[serde(default)]
    resource_prefix: String,
    resource_name: String,
    #[serde(default)]
    resource_type: String,
}

/// One configured pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Overrides the daemon-wide prefix when non-empty
    pub resource_prefix: String,
    pub resource_name: String,
    pub resource_type: String,
    pub device_config: DeviceConfig,
}

impl ResourceConfig {
    /// Prefix in effect for this pool.
    pub fn prefix<'a>(&'a self, default_prefix: &'a str) -> &'a str {
        if self.resource_prefix.is_empty() {
            default_prefix
        } else {
            &self.resource_prefix
        }
    }

    /// `<prefix>/<name>` as advertised to the orchestrator.
    pub fn full_name(&self, default_prefix: &str) -> String {
        format!("{}/{}", self.prefix(default_prefix), self.resource_name)
    }

    pub fn common_selectors(&self) -> Option<&CommonSelectors> {
        match &self.device_config {
            DeviceConfig::NetDevice(config) => Some(&config.selectors.common),
            DeviceConfig::Unknown => None,
        }
    }

    pub fn as_net(&self) -> Option<&NetDeviceConfig> {
        match &self.device_config {
            DeviceConfig::NetDevice(config) => Some(config),
            DeviceConfig::Unknown => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceConfList {
    resource_list: Vec<Value>,
}

/// Decode the `resourceList` document. Each block is read as the common
/// envelope first and then, by `resourceType`, as its type payload. An empty
/// `resourceType` means `netdevice`.
pub fn parse_resource_list(text: &str) -> Result<Vec<ResourceConfig>, Report<ConfigError>> {
    let list: ResourceConfList = serde_json::from_str(text).change_context(ConfigError::Parse)?;

    let mut configs = Vec::with_capacity(list.resource_list.len());
    for (index, raw) in list.resource_list.into_iter().enumerate() {
        let common = CommonResourceConfig::deserialize(&raw)
            .change_context(ConfigError::Parse)
            .attach_printable_lazy(|| format!("resource block #{index}"))?;

        let resource_type = if common.resource_type.is_empty() {
            NET_DEVICE_TYPE.to_string()
        } else {
            common.resource_type
        };
        let device_config = if resource_type == NET_DEVICE_TYPE {
            DeviceConfig::NetDevice(
                NetDeviceConfig::deserialize(&raw)
                    .change_context(ConfigError::Parse)
                    .attach_printable_lazy(|| {
                        format!("netdevice payload of {}", common.resource_name)
                    })?,
            )
        } else {
            DeviceConfig::Unknown
        };

        configs.push(ResourceConfig {
            resource_prefix: common.resource_prefix,
            resource_name: common.resource_name,
            resource_type,
            device_config,
        });
    }

    Ok(configs)
}

/// Read and decode the configuration file at `path`.
pub fn read_resource_list(path: &Path) -> Result<Vec<ResourceConfig>, Report<ConfigError>> {
    let text = fs::read_to_string(path).change_context(ConfigError::Read {
        path: path.display().to_string(),
    })?;
    let configs = parse_resource_list(&text)?;
    info!(path = %path.display(), pools = configs.len(), "resource config loaded");
    Ok(configs)
}

/// Check every name against the token pattern and the combined names for
/// uniqueness. Reports the first violation in list order.
pub fn validate_configs(
    configs: &[ResourceConfig],
    default_prefix: &str,
) -> Result<(), Report<ConfigError>> {
    let mut seen = BTreeSet::new();
    for config in configs {
        if !RESOURCE_NAME_RE.is_match(&config.resource_name) {
            return Err(Report::new(ConfigError::InvalidName {
                name: config.resource_name.clone(),
            })
            .attach_printable("resource names may only contain letters, digits, '_' and '.'"));
        }

        let full_name = config.full_name(default_prefix);
        if !seen.insert(full_name.clone()) {
            return Err(Report::new(ConfigError::DuplicateName { name: full_name }));
        }
    }
    Ok(())
}
