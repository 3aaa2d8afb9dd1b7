//! Resource factory.
//!
//! The factory is the registry every pipeline stage goes through: device types
//! by resource-type tag, info providers by driver name, selectors by name,
//! plus construction of pools and their protocol adapters. It is built once at
//! startup and passed by reference; nothing is looked up globally.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::config::ResourceConfig;
use crate::devices::Device;
use crate::devices::DeviceType;
use crate::devices::NetDeviceType;
use crate::info_provider::DeviceInfoProvider;
use crate::info_provider::GenericInfoProvider;
use crate::info_provider::RdmaInfoProvider;
use crate::info_provider::UioInfoProvider;
use crate::info_provider::UserVdpaInfoProvider;
use crate::info_provider::VfioInfoProvider;
use crate::info_provider::RDMA_KEY;
use crate::info_provider::UIO_DRIVERS;
use crate::info_provider::VDPA_CLIENT_KEY;
use crate::info_provider::VDPA_SERVER_KEY;
use crate::info_provider::VFIO_DRIVER;
use crate::inventory::HostInventory;
use crate::pool::NetResourcePool;
use crate::pool::ResourcePool;
use crate::rdma::RdmaSpec;
use crate::selectors::DeviceSelector;
use crate::selectors::SelectorKind;
use crate::server::PoolServer;
use crate::server::ResourceServer;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Unsupported selector: {name}")]
    UnsupportedSelector { name: String },
    #[error("Unsupported resource type: {resource_type}")]
    UnsupportedResourceType { resource_type: String },
    #[error("Failed to build resource pool {resource_name}")]
    PoolConstruction { resource_name: String },
}

/// Where protocol adapters put their sockets and device-info files.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Daemon-wide resource prefix
    pub resource_prefix: String,
    pub socket_dir: PathBuf,
    pub device_info_dir: PathBuf,
    /// Registry mode; adapters run without a socket watcher
    pub plugin_watch: bool,
}

#[derive(Debug)]
pub struct ResourceFactory {
    inventory: Arc<dyn HostInventory>,
    device_types: BTreeMap<&'static str, Arc<dyn DeviceType>>,
    info_providers: BTreeMap<String, Arc<dyn DeviceInfoProvider>>,
    generic_provider: Arc<dyn DeviceInfoProvider>,
    settings: ServerSettings,
    shutdown: CancellationToken,
}

impl ResourceFactory {
    /// Registry with every built-in device type and info provider.
    ///
    /// Adapters get child tokens of `shutdown`.
    pub fn new(
        inventory: Arc<dyn HostInventory>,
        settings: ServerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let mut info_providers: BTreeMap<String, Arc<dyn DeviceInfoProvider>> = BTreeMap::new();
        info_providers.insert(
            VFIO_DRIVER.to_string(),
            Arc::new(VfioInfoProvider::new(inventory.clone())),
        );
        let uio: Arc<dyn DeviceInfoProvider> = Arc::new(UioInfoProvider::new(inventory.clone()));
        for driver in UIO_DRIVERS {
            info_providers.insert(driver.to_string(), uio.clone());
        }
        info_providers.insert(
            RDMA_KEY.to_string(),
            Arc::new(RdmaInfoProvider::new(inventory.clone())),
        );
        let user_vdpa: Arc<dyn DeviceInfoProvider> = Arc::new(UserVdpaInfoProvider);
        for key in [VDPA_CLIENT_KEY, VDPA_SERVER_KEY] {
            info_providers.insert(key.to_string(), user_vdpa.clone());
        }

        let mut device_types: BTreeMap<&'static str, Arc<dyn DeviceType>> = BTreeMap::new();
        let net: Arc<dyn DeviceType> = Arc::new(NetDeviceType);
        device_types.insert(net.name(), net);

        Self {
            inventory,
            device_types,
            info_providers,
            generic_provider: Arc::new(GenericInfoProvider),
            settings,
            shutdown,
        }
    }

    pub fn inventory(&self) -> &dyn HostInventory {
        self.inventory.as_ref()
    }

    pub fn inventory_handle(&self) -> Arc<dyn HostInventory> {
        self.inventory.clone()
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Provider registered for `key`, the generic provider otherwise.
    pub fn info_provider(&self, key: &str) -> Arc<dyn DeviceInfoProvider> {
        self.info_providers
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.generic_provider.clone())
    }

    pub fn selector(
        &self,
        name: &str,
        values: &[String],
    ) -> Result<Box<dyn DeviceSelector>, Report<FactoryError>> {
        let kind = SelectorKind::from_name(name).ok_or_else(|| {
            Report::new(FactoryError::UnsupportedSelector {
                name: name.to_string(),
            })
        })?;
        Ok(kind.build(values, &self.inventory))
    }

    pub fn device_type(&self, tag: &str) -> Result<Arc<dyn DeviceType>, Report<FactoryError>> {
        self.device_types.get(tag).cloned().ok_or_else(|| {
            Report::new(FactoryError::UnsupportedResourceType {
                resource_type: tag.to_string(),
            })
        })
    }

    pub fn device_types(&self) -> impl Iterator<Item = &Arc<dyn DeviceType>> {
        self.device_types.values()
    }

    /// Freeze `devices` into the pool described by `config`.
    pub fn resource_pool(
        &self,
        config: &ResourceConfig,
        devices: &[Arc<Device>],
    ) -> Result<Arc<dyn ResourcePool>, Report<FactoryError>> {
        match &config.device_config {
            DeviceConfig::NetDevice(net_config) => {
                let pool = NetResourcePool::build(config, net_config, devices, self);
                Ok(Arc::new(pool))
            }
            DeviceConfig::Unknown => Err(Report::new(FactoryError::UnsupportedResourceType {
                resource_type: config.resource_type.clone(),
            })
            .attach_printable(format!("pool {}", config.resource_name))
            .change_context(FactoryError::PoolConstruction {
                resource_name: config.resource_name.clone(),
            })),
        }
    }

    /// Protocol adapter serving `pool`.
    pub fn resource_server(
        &self,
        pool: Arc<dyn ResourcePool>,
    ) -> Result<Arc<dyn ResourceServer>, Report<FactoryError>> {
        Ok(Arc::new(PoolServer::new(
            pool,
            self.settings.clone(),
            self.shutdown.child_token(),
        )))
    }

    pub fn rdma_spec(&self, pci_addr: &str) -> RdmaSpec {
        RdmaSpec::resolve(self.inventory.as_ref(), pci_addr)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::inventory::fake::FakeInventory;

    pub(crate) fn settings() -> ServerSettings {
        ServerSettings {
            resource_prefix: "intel.com".to_string(),
            socket_dir: PathBuf::from("/nonexistent/device-plugins"),
            device_info_dir: PathBuf::from("/nonexistent/devinfo"),
            plugin_watch: true,
        }
    }

    pub(crate) fn factory_with(inventory: FakeInventory) -> ResourceFactory {
        ResourceFactory::new(Arc::new(inventory), settings(), CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::testing::factory_with;
    use super::*;
    use crate::config::NetDeviceConfig;
    use crate::devices::testing::net_device;
    use crate::inventory::fake::FakeInventory;

    #[test]
    fn unknown_driver_falls_back_to_generic_provider() {
        let factory = factory_with(FakeInventory::default());

        let provider = factory.info_provider("ixgbevf");

        assert!(provider.device_specs("0000:3b:10.0").is_empty());
        assert!(provider.mounts("0000:3b:10.0").is_empty());
        assert_eq!(provider.env_val("0000:3b:10.0"), "0000:3b:10.0");
    }

    #[test]
    fn uio_drivers_share_a_provider() {
        let factory = factory_with(FakeInventory::default());

        for driver in UIO_DRIVERS {
            assert!(format!("{:?}", factory.info_provider(driver)).contains("UioInfoProvider"));
        }
        assert!(format!("{:?}", factory.info_provider(VFIO_DRIVER)).contains("VfioInfoProvider"));
    }

    #[test]
    fn user_vdpa_modes_share_a_provider() {
        let factory = factory_with(FakeInventory::default());

        for key in [VDPA_CLIENT_KEY, VDPA_SERVER_KEY] {
            let provider = factory.info_provider(key);
            assert!(format!("{provider:?}").contains("UserVdpaInfoProvider"));
            assert_eq!(
                provider.env_val("0000:65:00.2"),
                "/var/run/uvdpa/0000__65__00_2/vdpa.sock"
            );
        }
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let factory = factory_with(FakeInventory::default());

        let err = factory
            .selector("colors", &["red".to_string()])
            .expect_err("colors is not a selector");

        assert!(matches!(
            err.current_context(),
            FactoryError::UnsupportedSelector { name } if name == "colors"
        ));
        assert!(factory.selector("vendors", &["8086".to_string()]).is_ok());
    }

    #[test]
    fn unknown_resource_type_cannot_build_a_pool() {
        let factory = factory_with(FakeInventory::default());
        let config = ResourceConfig {
            resource_prefix: String::new(),
            resource_name: "accel".to_string(),
            resource_type: "accelerator".to_string(),
            device_config: DeviceConfig::Unknown,
        };

        let err = factory
            .resource_pool(&config, &[])
            .expect_err("no pool for unknown types");

        assert!(matches!(
            err.current_context(),
            FactoryError::PoolConstruction { .. }
        ));
        assert!(factory.device_type("accelerator").is_err());
    }

    #[test]
    fn netdevice_pool_is_built() {
        let factory = factory_with(FakeInventory::default());
        let config = ResourceConfig {
            resource_prefix: String::new(),
            resource_name: "nics".to_string(),
            resource_type: "netdevice".to_string(),
            device_config: DeviceConfig::NetDevice(NetDeviceConfig::default()),
        };
        let devices = vec![Arc::new(net_device("0000:3b:02.0", "8086", "154c", "iavf"))];

        let pool = factory
            .resource_pool(&config, &devices)
            .expect("should build pool");

        assert_eq!(pool.resource_name(), "nics");
        assert_eq!(pool.resource_prefix(), "intel.com");
        assert_eq!(pool.devices().len(), 1);
    }
}
