//! Daemon lifecycle: bring the manager up, wait for a stop signal, drain.

use std::sync::Arc;

use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::config::DaemonArgs;
use crate::inventory::SysfsInventory;
use crate::manager::ManagerError;
use crate::manager::ManagerSettings;
use crate::manager::ResourceManager;

pub struct Daemon {
    args: DaemonArgs,
    manager: ResourceManager,
}

impl Daemon {
    pub fn new(args: DaemonArgs) -> Self {
        let inventory = SysfsInventory::new(&args.sysfs_root, &args.procfs_root, &args.dev_root);
        let manager = ResourceManager::new(Arc::new(inventory), ManagerSettings::from(&args));
        Self { args, manager }
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    /// Run every startup phase. Servers already started are stopped again
    /// when a later one fails.
    pub async fn start(&mut self) -> Result<(), Report<ManagerError>> {
        self.manager.load_config(&self.args.config_file)?;
        self.manager.discover_host_devices()?;
        self.manager.init_servers()?;

        if let Err(e) = self.manager.start_all_servers().await {
            if let Err(stop_err) = self.manager.stop_all_servers().await {
                warn!(error = ?stop_err, "cleanup after failed start did not complete");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Wait for SIGTERM, SIGINT or a server task ending on its own. The
    /// latter is returned as an error once the caller has shut down.
    pub async fn wait_for_shutdown(&mut self) -> anyhow::Result<()> {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            e = self.manager.wait_for_task_exit() => {
                warn!("Resource server task ended, shutting down");
                return Err(anyhow::anyhow!("{e:?}"));
            }
        }
        Ok(())
    }

    /// Stop every server. There is no deadline; the first stop failure is
    /// returned after all servers were asked to stop.
    pub async fn shutdown(&mut self) -> Result<(), Report<ManagerError>> {
        self.manager.stop_all_servers().await
    }
}
