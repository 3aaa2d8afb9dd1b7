//! Resource manager: configuration, discovery, pool construction and the
//! lifecycle of every pool's server.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::parse_resource_list;
use crate::config::read_resource_list;
use crate::config::validate_configs;
use crate::config::DaemonArgs;
use crate::config::ResourceConfig;
use crate::devices::Device;
use crate::factory::ResourceFactory;
use crate::factory::ServerSettings;
use crate::inventory::HostInventory;
use crate::link_watcher::LinkWatcher;
use crate::selectors::SelectorPipeline;
use crate::server::ResourceServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ManagerState {
    Unconfigured,
    Configured,
    Discovering,
    PoolsBuilt,
    Serving,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Invalid resource configuration")]
    Config,
    #[error("Host inventory is unavailable")]
    Inventory,
    #[error("Failed to build resource pool {resource_name}")]
    PoolBuild { resource_name: String },
    #[error("Failed to start resource server {resource_name}")]
    Start { resource_name: String },
    #[error("Failed to stop resource server {resource_name}")]
    Stop { resource_name: String },
    #[error("Task of resource server {resource_name} ended while serving")]
    TaskExited { resource_name: String },
    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },
}

/// Paths and names the manager needs from the command line.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub resource_prefix: String,
    pub plugin_registry_dir: PathBuf,
    pub device_plugin_dir: PathBuf,
    pub device_info_dir: PathBuf,
}

impl From<&DaemonArgs> for ManagerSettings {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            resource_prefix: args.resource_prefix.clone(),
            plugin_registry_dir: args.plugin_registry_dir.clone(),
            device_plugin_dir: args.device_plugin_dir.clone(),
            device_info_dir: args.device_info_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ResourceManager {
    state: ManagerState,
    factory: ResourceFactory,
    configs: Vec<ResourceConfig>,
    /// Discovered devices by device type name
    devices: BTreeMap<&'static str, Vec<Arc<Device>>>,
    /// Link watchers by interface name
    link_watchers: BTreeMap<String, LinkWatcher>,
    servers: Vec<Arc<dyn ResourceServer>>,
    /// Socket watches of legacy mode, by resource name
    watch_tasks: Vec<(String, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl ResourceManager {
    /// The deployment mode is fixed here: registry mode when the plugin
    /// registry directory exists, legacy mode otherwise.
    pub fn new(inventory: Arc<dyn HostInventory>, settings: ManagerSettings) -> Self {
        let plugin_watch = settings.plugin_registry_dir.is_dir();
        let socket_dir = if plugin_watch {
            settings.plugin_registry_dir
        } else {
            settings.device_plugin_dir
        };
        info!(
            registry_mode = plugin_watch,
            socket_dir = %socket_dir.display(),
            "deployment mode selected"
        );

        let shutdown = CancellationToken::new();
        let factory = ResourceFactory::new(
            inventory,
            ServerSettings {
                resource_prefix: settings.resource_prefix,
                socket_dir,
                device_info_dir: settings.device_info_dir,
                plugin_watch,
            },
            shutdown.clone(),
        );

        Self {
            state: ManagerState::Unconfigured,
            factory,
            configs: Vec::new(),
            devices: BTreeMap::new(),
            link_watchers: BTreeMap::new(),
            servers: Vec::new(),
            watch_tasks: Vec::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn factory(&self) -> &ResourceFactory {
        &self.factory
    }

    pub fn configs(&self) -> &[ResourceConfig] {
        &self.configs
    }

    pub fn servers(&self) -> &[Arc<dyn ResourceServer>] {
        &self.servers
    }

    pub fn devices(&self, device_type: &str) -> &[Arc<Device>] {
        self.devices.get(device_type).map_or(&[], Vec::as_slice)
    }

    pub fn link_watchers(&self) -> impl Iterator<Item = &LinkWatcher> {
        self.link_watchers.values()
    }

    fn expect_state(
        &self,
        expected: ManagerState,
        operation: &'static str,
    ) -> Result<(), Report<ManagerError>> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Report::new(ManagerError::InvalidState {
                operation,
                state: self.state,
            }))
        }
    }

    /// Read, decode and validate the configuration file.
    pub fn load_config(&mut self, path: &Path) -> Result<(), Report<ManagerError>> {
        self.expect_state(ManagerState::Unconfigured, "load config")?;
        let configs = read_resource_list(path).change_context(ManagerError::Config)?;
        self.configure(configs)
    }

    pub fn load_config_text(&mut self, text: &str) -> Result<(), Report<ManagerError>> {
        self.expect_state(ManagerState::Unconfigured, "load config")?;
        let configs = parse_resource_list(text).change_context(ManagerError::Config)?;
        self.configure(configs)
    }

    fn configure(&mut self, configs: Vec<ResourceConfig>) -> Result<(), Report<ManagerError>> {
        validate_configs(&configs, &self.factory.settings().resource_prefix)
            .change_context(ManagerError::Config)?;
        for config in &configs {
            debug!(
                resource = %config.full_name(&self.factory.settings().resource_prefix),
                resource_type = %config.resource_type,
                "resource configured"
            );
        }
        self.configs = configs;
        self.state = ManagerState::Configured;
        Ok(())
    }

    /// Enumerate the host once and classify it for every device type.
    pub fn discover_host_devices(&mut self) -> Result<(), Report<ManagerError>> {
        self.expect_state(ManagerState::Configured, "discover devices")?;
        let records = self
            .factory
            .inventory()
            .pci_devices()
            .change_context(ManagerError::Inventory)?;
        self.state = ManagerState::Discovering;
        info!(functions = records.len(), "discovering host devices");

        let device_types: Vec<_> = self.factory.device_types().cloned().collect();
        for device_type in device_types {
            let discovery = device_type.discover_host_devices(&records, &self.factory);
            info!(
                device_type = device_type.name(),
                devices = discovery.devices.len(),
                watched = discovery.watch_list.len(),
                "device discovery finished"
            );
            self.add_link_watchers(&discovery.watch_list);
            self.devices.insert(device_type.name(), discovery.devices);
        }
        Ok(())
    }

    fn add_link_watchers(&mut self, watch_list: &[String]) {
        for pci_addr in watch_list {
            let if_name = match self.factory.inventory().net_names(pci_addr) {
                Ok(names) => match names.into_iter().next() {
                    Some(name) => name,
                    None => continue,
                },
                Err(e) => {
                    debug!(error = ?e, %pci_addr, "no interface to watch");
                    continue;
                }
            };
            if self.link_watchers.contains_key(&if_name) {
                continue;
            }
            let watcher = LinkWatcher::new(if_name.clone());
            watcher.subscribe();
            self.link_watchers.insert(if_name, watcher);
        }
    }

    /// Build one pool and its server per configuration. Any failure aborts.
    pub fn init_servers(&mut self) -> Result<(), Report<ManagerError>> {
        self.expect_state(ManagerState::Discovering, "build pools")?;
        let default_prefix = self.factory.settings().resource_prefix.clone();

        let mut servers = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            let pool_error = || ManagerError::PoolBuild {
                resource_name: config.full_name(&default_prefix),
            };

            let pipeline =
                SelectorPipeline::for_config(config, &self.factory).change_context_lazy(pool_error)?;
            let candidates = self.devices(&config.resource_type);
            let selected = pipeline.filter(candidates);
            info!(
                resource = %config.full_name(&default_prefix),
                stages = pipeline.len(),
                candidates = candidates.len(),
                selected = selected.len(),
                "selectors applied"
            );

            let pool = self
                .factory
                .resource_pool(config, &selected)
                .change_context_lazy(pool_error)?;
            if pool.devices().is_empty() {
                warn!(resource = %config.full_name(&default_prefix), "resource pool is empty");
            }
            let server = self
                .factory
                .resource_server(pool)
                .change_context_lazy(pool_error)?;
            servers.push(server);
        }

        warn_overlapping_pools(&servers);
        self.servers = servers;
        self.state = ManagerState::PoolsBuilt;
        Ok(())
    }

    /// Start every server; in legacy mode each also gets a socket watcher.
    pub async fn start_all_servers(&mut self) -> Result<(), Report<ManagerError>> {
        self.expect_state(ManagerState::PoolsBuilt, "start servers")?;

        for server in &self.servers {
            server
                .start()
                .await
                .change_context_lazy(|| ManagerError::Start {
                    resource_name: server.resource_name().to_string(),
                })?;
        }

        if !self.factory.settings().plugin_watch {
            for server in &self.servers {
                let server = server.clone();
                let name = server.resource_name().to_string();
                let task = tokio::spawn(async move {
                    debug!(resource = %server.resource_name(), "socket watch started");
                    server.watch().await;
                });
                self.watch_tasks.push((name, task));
            }
        }

        info!(servers = self.servers.len(), "all resource servers started");
        self.state = ManagerState::Serving;
        Ok(())
    }

    /// Resolves when a serve loop or a socket watch of any server finished
    /// on its own. Never resolves when nothing runs.
    pub async fn wait_for_task_exit(&mut self) -> Report<ManagerError> {
        let servers = self.servers.clone();
        let serve_exit = async {
            if servers.is_empty() {
                return futures::future::pending().await;
            }
            let (_, index, _) =
                futures::future::select_all(servers.iter().map(|server| server.exited())).await;
            servers[index].resource_name().to_string()
        };

        let watch_tasks = &mut self.watch_tasks;
        let watch_exit = async {
            if watch_tasks.is_empty() {
                return futures::future::pending().await;
            }
            let (result, index, _) =
                futures::future::select_all(watch_tasks.iter_mut().map(|(_, task)| task)).await;
            let (name, _) = watch_tasks.swap_remove(index);
            if let Err(e) = result {
                warn!(error = %e, resource = %name, "socket watch task panicked");
            }
            name
        };

        let resource_name = tokio::select! {
            name = serve_exit => name,
            name = watch_exit => name,
        };
        error!(resource = %resource_name, "resource server task ended unexpectedly");
        Report::new(ManagerError::TaskExited { resource_name })
    }

    /// Stop every server, continuing past failures; the first failure is
    /// returned. Stopping again is a no-op.
    pub async fn stop_all_servers(&mut self) -> Result<(), Report<ManagerError>> {
        match self.state {
            ManagerState::Stopped => return Ok(()),
            ManagerState::PoolsBuilt | ManagerState::Serving => {}
            state => {
                return Err(Report::new(ManagerError::InvalidState {
                    operation: "stop servers",
                    state,
                }))
            }
        }
        self.state = ManagerState::Draining;

        let mut first_error = None;
        for server in &self.servers {
            if let Err(e) = server.stop().await {
                error!(error = ?e, resource = %server.resource_name(), "failed to stop resource server");
                first_error.get_or_insert(e.change_context(ManagerError::Stop {
                    resource_name: server.resource_name().to_string(),
                }));
            }
        }

        self.shutdown.cancel();
        let watch_tasks = self.watch_tasks.drain(..).map(|(_, task)| task);
        for result in futures::future::join_all(watch_tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "socket watch task panicked");
            }
        }

        self.state = ManagerState::Stopped;
        info!("all resource servers stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Devices selected by more than one pool are served by all of them.
fn warn_overlapping_pools(servers: &[Arc<dyn ResourceServer>]) {
    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for server in servers {
        for id in server.pool().devices().keys() {
            owners.entry(id.as_str()).or_default().push(server.resource_name());
        }
    }
    for (id, pools) in owners {
        if pools.len() > 1 {
            warn!(device = %id, ?pools, "device is shared by more than one resource pool");
        }
    }
}
