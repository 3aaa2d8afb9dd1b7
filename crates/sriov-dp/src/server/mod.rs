//! Per-pool protocol adapters.
//!
//! Each pool is served on its own unix socket, `<socket dir>/<prefix>_<name>.sock`,
//! speaking the line-delimited JSON protocol in [`protocol`].

pub mod protocol;
mod watcher;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use api_types::AllocateResponse;
use api_types::ContainerAllocateRequest;
use api_types::ContainerAllocateResponse;
use api_types::DevicePluginOptions;
use api_types::ListAndWatchResponse;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_info;
use crate::device_info::DeviceInfoError;
use crate::factory::ServerSettings;
use crate::pool::ResourcePool;
use protocol::Empty;
use protocol::PluginRequest;
use protocol::PluginResponse;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind socket {path}")]
    Bind { path: String },
    #[error("Failed to remove socket {path}")]
    SocketCleanup { path: String },
    #[error("Failed to watch {path}")]
    Watch { path: String },
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Device {id} does not belong to {resource}")]
    UnknownDevice { resource: String, id: String },
    #[error("Server has been stopped")]
    Stopped,
}

/// Serves one resource pool to the orchestrator.
#[async_trait]
pub trait ResourceServer: Send + Sync + fmt::Debug {
    /// `<prefix>/<name>` of the served pool
    fn resource_name(&self) -> &str;

    fn pool(&self) -> &Arc<dyn ResourcePool>;

    fn socket_path(&self) -> &Path;

    /// Bind the socket and begin answering requests.
    async fn start(&self) -> Result<(), Report<ServerError>>;

    /// Stop serving, remove the socket and the device-info files this
    /// adapter wrote. Calling it again is a no-op.
    async fn stop(&self) -> Result<(), Report<ServerError>>;

    /// Restart serving whenever the socket disappears, until stopped.
    async fn watch(&self);

    /// Resolves once a serve loop ended without being told to stop.
    async fn exited(&self);

    fn options(&self) -> DevicePluginOptions;

    fn list_devices(&self) -> ListAndWatchResponse;

    fn allocate(
        &self,
        requests: &[ContainerAllocateRequest],
    ) -> Result<AllocateResponse, Report<ServerError>>;
}

/// Environment variable carrying the allocated ids:
/// `PCIDEVICE_<full name>` upper-cased with every other character as `_`.
pub fn env_key(full_name: &str) -> String {
    let name: String = full_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PCIDEVICE_{name}")
}

pub fn socket_name(prefix: &str, name: &str) -> String {
    format!("{prefix}_{name}.sock")
}

/// Request handling shared by every connection of one adapter.
struct PoolService {
    pool: Arc<dyn ResourcePool>,
    full_name: String,
    env_key: String,
    device_info_dir: PathBuf,
    /// Ids whose device-info files this adapter wrote
    written: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for PoolService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolService")
            .field("full_name", &self.full_name)
            .field("device_info_dir", &self.device_info_dir)
            .finish()
    }
}

impl PoolService {
    fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions::default()
    }

    fn list_devices(&self) -> ListAndWatchResponse {
        if self.pool.probe() {
            debug!(resource = %self.full_name, "device health changed");
        }
        ListAndWatchResponse {
            devices: self.pool.devices().values().cloned().collect(),
        }
    }

    fn allocate(
        &self,
        requests: &[ContainerAllocateRequest],
    ) -> Result<AllocateResponse, Report<ServerError>> {
        let devices = self.pool.devices();
        for request in requests {
            if let Some(id) = request.devices_ids.iter().find(|id| !devices.contains_key(*id)) {
                return Err(Report::new(ServerError::UnknownDevice {
                    resource: self.full_name.clone(),
                    id: id.clone(),
                }));
            }
        }

        let mut container_responses = Vec::with_capacity(requests.len());
        for request in requests {
            let ids = &request.devices_ids;
            let mut envs = BTreeMap::new();
            envs.insert(self.env_key.clone(), self.pool.envs(ids).join(","));

            container_responses.push(ContainerAllocateResponse {
                envs,
                mounts: self.pool.mounts(ids),
                devices: self.pool.device_specs(ids),
                annotations: BTreeMap::new(),
            });
            self.write_device_info(ids);
            info!(resource = %self.full_name, devices = ?ids, "devices allocated");
        }

        Ok(AllocateResponse {
            container_responses,
        })
    }

    /// Failures are logged; allocation still succeeds.
    fn write_device_info(&self, ids: &[String]) {
        for id in ids {
            let Some(info) = self.pool.device_info(id) else {
                continue;
            };
            // A previous allocation of the same device may have left its file.
            if let Err(e) = device_info::clean(&self.device_info_dir, &self.full_name, id) {
                warn!(error = ?e, device = %id, "failed to replace device-info file");
                continue;
            }
            match device_info::save(&self.device_info_dir, &self.full_name, id, &info) {
                Ok(_) => {
                    if let Ok(mut written) = self.written.lock() {
                        written.insert(id.clone());
                    }
                }
                Err(e) => error!(error = ?e, device = %id, "failed to write device-info file"),
            }
        }
    }

    fn clean_device_info(&self) -> Result<(), Report<DeviceInfoError>> {
        let ids = match self.written.lock() {
            Ok(mut written) => std::mem::take(&mut *written),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut first_error = None;
        for id in ids {
            if let Err(e) = device_info::clean(&self.device_info_dir, &self.full_name, &id) {
                warn!(error = ?e, device = %id, "failed to remove device-info file");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn handle_line(&self, line: &str) -> PluginResponse {
        let request: PluginRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "undecodable request");
                return PluginResponse::error(format!("{}: {e}", ServerError::InvalidRequest));
            }
        };

        match request {
            PluginRequest::GetDevicePluginOptions => PluginResponse::Options(self.options()),
            PluginRequest::ListAndWatch => PluginResponse::Devices(self.list_devices()),
            PluginRequest::Allocate { container_requests } => {
                match self.allocate(&container_requests) {
                    Ok(response) => PluginResponse::Allocate(response),
                    Err(e) => {
                        warn!(error = ?e, "allocation rejected");
                        PluginResponse::error(e.current_context().to_string())
                    }
                }
            }
            PluginRequest::PreStartContainer { devices_ids } => {
                debug!(devices = ?devices_ids, "pre-start container");
                PluginResponse::PreStartContainer(Empty {})
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream, token: CancellationToken) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "connection read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line);
            let mut body = match serde_json::to_vec(&response) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "failed to encode response");
                    break;
                }
            };
            body.push(b'\n');
            if let Err(e) = writer.write_all(&body).await {
                debug!(error = %e, "connection write failed");
                break;
            }
        }
    }
}

/// Accept connections until `token` is cancelled. `exited` is cancelled when
/// the loop ends any other way, including a panic.
async fn serve(
    listener: UnixListener,
    service: Arc<PoolService>,
    token: CancellationToken,
    exited: CancellationToken,
) {
    let exit_guard = exited.drop_guard();
    let mut incoming = UnixListenerStream::new(listener);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = incoming.next() => match next {
                Some(Ok(stream)) => {
                    tokio::spawn(service.clone().handle_connection(stream, token.clone()));
                }
                Some(Err(e)) => warn!(error = %e, "failed to accept connection"),
                None => break,
            },
        }
    }

    if token.is_cancelled() {
        exit_guard.disarm();
        debug!(resource = %service.full_name, "serve loop finished");
    } else {
        error!(resource = %service.full_name, "serve loop ended unexpectedly");
    }
}

#[derive(Debug, Default)]
struct ServeState {
    serving: Option<(CancellationToken, JoinHandle<()>)>,
    stopped: bool,
}

/// Unix socket adapter of one pool.
#[derive(Debug)]
pub struct PoolServer {
    service: Arc<PoolService>,
    socket_path: PathBuf,
    /// Cancelled on stop; parents the serve loop and the watcher
    scope: CancellationToken,
    /// Cancelled when a serve loop ends on its own
    exited: CancellationToken,
    state: tokio::sync::Mutex<ServeState>,
}

impl PoolServer {
    pub fn new(
        pool: Arc<dyn ResourcePool>,
        settings: ServerSettings,
        scope: CancellationToken,
    ) -> Self {
        let prefix = if pool.resource_prefix().is_empty() {
            settings.resource_prefix.clone()
        } else {
            pool.resource_prefix().to_string()
        };
        let full_name = format!("{prefix}/{}", pool.resource_name());
        let socket_path = settings
            .socket_dir
            .join(socket_name(&prefix, pool.resource_name()));

        Self {
            service: Arc::new(PoolService {
                env_key: env_key(&full_name),
                full_name,
                device_info_dir: settings.device_info_dir,
                written: Mutex::new(BTreeSet::new()),
                pool,
            }),
            socket_path,
            scope,
            exited: CancellationToken::new(),
            state: tokio::sync::Mutex::new(ServeState::default()),
        }
    }

    fn remove_socket(&self) -> Result<(), Report<ServerError>> {
        match fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(ServerError::SocketCleanup {
                path: self.socket_path.display().to_string(),
            })),
        }
    }

    async fn halt_serving(&self, state: &mut ServeState) {
        if let Some((token, handle)) = state.serving.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, resource = %self.service.full_name, "serve loop did not finish cleanly");
            }
        }
    }

    fn bind(&self, state: &mut ServeState) -> Result<(), Report<ServerError>> {
        let bind_error = || ServerError::Bind {
            path: self.socket_path.display().to_string(),
        };

        if let Some(dir) = self.socket_path.parent() {
            fs::create_dir_all(dir).change_context_lazy(bind_error)?;
        }
        self.remove_socket()?;
        let listener = UnixListener::bind(&self.socket_path).change_context_lazy(bind_error)?;

        let token = self.scope.child_token();
        let handle = tokio::spawn(serve(
            listener,
            self.service.clone(),
            token.clone(),
            self.exited.clone(),
        ));
        state.serving = Some((token, handle));
        info!(
            resource = %self.service.full_name,
            socket = %self.socket_path.display(),
            devices = self.service.pool.devices().len(),
            "resource server started"
        );
        Ok(())
    }

    async fn restart(&self) -> Result<(), Report<ServerError>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Report::new(ServerError::Stopped));
        }
        self.halt_serving(&mut state).await;
        self.bind(&mut state)
    }
}

#[async_trait]
impl ResourceServer for PoolServer {
    fn resource_name(&self) -> &str {
        &self.service.full_name
    }

    fn pool(&self) -> &Arc<dyn ResourcePool> {
        &self.service.pool
    }

    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn start(&self) -> Result<(), Report<ServerError>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Report::new(ServerError::Stopped));
        }
        if state.serving.is_some() {
            return Ok(());
        }
        self.bind(&mut state)
    }

    async fn stop(&self) -> Result<(), Report<ServerError>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        self.scope.cancel();
        self.halt_serving(&mut state).await;

        let socket_result = self.remove_socket();
        let info_result = self
            .service
            .clean_device_info()
            .change_context(ServerError::SocketCleanup {
                path: self.service.device_info_dir.display().to_string(),
            });
        info!(resource = %self.service.full_name, "resource server stopped");
        socket_result.and(info_result)
    }

    async fn watch(&self) {
        loop {
            if !watcher::wait_for_removal(&self.socket_path, &self.scope, watcher::POLL_INTERVAL)
                .await
            {
                debug!(resource = %self.service.full_name, "socket watch finished");
                return;
            }

            info!(
                resource = %self.service.full_name,
                socket = %self.socket_path.display(),
                "socket removed, restarting resource server"
            );
            if let Err(e) = self.restart().await {
                if matches!(e.current_context(), ServerError::Stopped) {
                    return;
                }
                error!(error = ?e, resource = %self.service.full_name, "failed to restart resource server");
                tokio::select! {
                    _ = self.scope.cancelled() => return,
                    _ = tokio::time::sleep(watcher::POLL_INTERVAL) => {}
                }
            }
        }
    }

    async fn exited(&self) {
        self.exited.cancelled().await
    }

    fn options(&self) -> DevicePluginOptions {
        self.service.options()
    }

    fn list_devices(&self) -> ListAndWatchResponse {
        self.service.list_devices()
    }

    fn allocate(
        &self,
        requests: &[ContainerAllocateRequest],
    ) -> Result<AllocateResponse, Report<ServerError>> {
        self.service.allocate(requests)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::config::NetDeviceConfig;
    use crate::config::ResourceConfig;
    use crate::devices::testing::net_device;
    use crate::factory::ResourceFactory;
    use crate::inventory::fake::FakeInventory;

    struct Harness {
        dir: TempDir,
        server: PoolServer,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("should create temp dir");
            let settings = ServerSettings {
                resource_prefix: "intel.com".to_string(),
                socket_dir: dir.path().join("plugins"),
                device_info_dir: dir.path().join("devinfo"),
                plugin_watch: false,
            };
            let factory = ResourceFactory::new(
                Arc::new(FakeInventory::default()),
                settings.clone(),
                CancellationToken::new(),
            );
            let config = ResourceConfig {
                resource_prefix: String::new(),
                resource_name: "sriov_nics".to_string(),
                resource_type: "netdevice".to_string(),
                device_config: DeviceConfig::NetDevice(NetDeviceConfig::default()),
            };
            let devices = vec![
                Arc::new(net_device("0000:3b:02.0", "8086", "154c", "iavf")),
                Arc::new(net_device("0000:3b:02.1", "8086", "154c", "iavf")),
            ];
            let pool = factory
                .resource_pool(&config, &devices)
                .expect("should build pool");
            let server = PoolServer::new(pool, settings, CancellationToken::new());
            Self { dir, server }
        }

        fn device_info_path(&self, id: &str) -> PathBuf {
            device_info::file_path(&self.dir.path().join("devinfo"), "intel.com/sriov_nics", id)
        }
    }

    async fn roundtrip(path: &Path, request: &str) -> serde_json::Value {
        let stream = UnixStream::connect(path).await.expect("should connect");
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(format!("{request}\n").as_bytes())
            .await
            .expect("should send request");
        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await
            .expect("should read response")
            .expect("should get a response line");
        serde_json::from_str(&line).expect("response should be json")
    }

    #[test]
    fn env_key_is_upper_cased_and_sanitized() {
        assert_eq!(env_key("intel.com/sriov_nics"), "PCIDEVICE_INTEL_COM_SRIOV_NICS");
        assert_eq!(env_key("example.com/nic-a"), "PCIDEVICE_EXAMPLE_COM_NIC_A");
    }

    #[test(tokio::test)]
    async fn socket_is_named_after_prefix_and_pool() {
        let harness = Harness::new();

        assert_eq!(harness.server.resource_name(), "intel.com/sriov_nics");
        assert_eq!(
            harness.server.socket_path(),
            harness.dir.path().join("plugins/intel.com_sriov_nics.sock")
        );
    }

    #[test(tokio::test)]
    async fn serves_device_list_and_allocations() {
        let harness = Harness::new();
        harness.server.start().await.expect("should start");
        let socket = harness.server.socket_path().to_path_buf();

        let listed = roundtrip(&socket, r#"{"method":"listAndWatch"}"#).await;
        let ids: Vec<&str> = listed["devices"]
            .as_array()
            .expect("devices array")
            .iter()
            .map(|d| d["id"].as_str().expect("device id"))
            .collect();
        assert_eq!(ids, vec!["0000:3b:02.0", "0000:3b:02.1"]);

        let allocated = roundtrip(
            &socket,
            r#"{"method":"allocate","containerRequests":[{"devicesIds":["0000:3b:02.1","0000:3b:02.0"]}]}"#,
        )
        .await;
        assert_eq!(
            allocated["containerResponses"][0]["envs"]["PCIDEVICE_INTEL_COM_SRIOV_NICS"],
            "0000:3b:02.1,0000:3b:02.0"
        );
        assert!(harness.device_info_path("0000:3b:02.0").exists());
        assert!(harness.device_info_path("0000:3b:02.1").exists());

        harness.server.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn unknown_device_is_rejected() {
        let harness = Harness::new();

        let err = harness
            .server
            .allocate(&[ContainerAllocateRequest {
                devices_ids: vec!["0000:3b:02.0".to_string(), "0000:af:00.0".to_string()],
            }])
            .expect_err("0000:af:00.0 is not in the pool");

        assert!(matches!(
            err.current_context(),
            ServerError::UnknownDevice { id, .. } if id == "0000:af:00.0"
        ));
        assert!(!harness.device_info_path("0000:3b:02.0").exists());
    }

    #[test(tokio::test)]
    async fn malformed_request_gets_an_error_line() {
        let harness = Harness::new();
        harness.server.start().await.expect("should start");

        let response = roundtrip(harness.server.socket_path(), "{not json").await;

        assert!(response["error"]
            .as_str()
            .expect("error message")
            .starts_with("Invalid request"));
        harness.server.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn stop_is_idempotent_and_cleans_up() {
        let harness = Harness::new();
        harness.server.start().await.expect("should start");
        harness
            .server
            .allocate(&[ContainerAllocateRequest {
                devices_ids: vec!["0000:3b:02.0".to_string()],
            }])
            .expect("should allocate");
        assert!(harness.device_info_path("0000:3b:02.0").exists());

        harness.server.stop().await.expect("should stop");
        harness.server.stop().await.expect("second stop is a no-op");

        assert!(!harness.server.socket_path().exists());
        assert!(!harness.device_info_path("0000:3b:02.0").exists());
        assert!(matches!(
            harness
                .server
                .start()
                .await
                .expect_err("stopped servers stay stopped")
                .current_context(),
            ServerError::Stopped
        ));
    }

    #[test(tokio::test)]
    async fn serve_loop_ending_on_its_own_is_reported() {
        let harness = Harness::new();
        harness.server.start().await.expect("should start");

        if let Some((_, handle)) = harness.server.state.lock().await.serving.as_ref() {
            handle.abort();
        }

        tokio::time::timeout(Duration::from_secs(5), harness.server.exited())
            .await
            .expect("aborted serve loop should be reported");
        harness.server.stop().await.expect("should stop");
    }

    #[test(tokio::test)]
    async fn stopped_serve_loop_is_not_reported() {
        let harness = Harness::new();
        harness.server.start().await.expect("should start");

        harness.server.stop().await.expect("should stop");

        assert!(
            tokio::time::timeout(Duration::from_millis(200), harness.server.exited())
                .await
                .is_err()
        );
    }

    #[test(tokio::test)]
    async fn removed_socket_is_recreated_by_watch() {
        let harness = Harness::new();
        let server = Arc::new(harness.server);
        server.start().await.expect("should start");
        let watch = {
            let server = server.clone();
            tokio::spawn(async move { server.watch().await })
        };

        fs::remove_file(server.socket_path()).expect("should remove socket");
        tokio::time::timeout(Duration::from_secs(10), async {
            while !server.socket_path().exists() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("socket should come back");

        let listed = roundtrip(server.socket_path(), r#"{"method":"listAndWatch"}"#).await;
        assert_eq!(listed["devices"].as_array().map(Vec::len), Some(2));

        server.stop().await.expect("should stop");
        tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .expect("watch should finish after stop")
            .expect("watch should not panic");
    }
}
