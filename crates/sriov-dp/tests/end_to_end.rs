//! Drives the daemon from a configuration file and a fake sysfs tree to a
//! serving pool socket.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use similar_asserts::assert_eq;
use sriov_dp::app::Daemon;
use sriov_dp::config::DaemonArgs;
use sriov_dp::manager::ManagerState;
use tempfile::TempDir;
use test_log::test;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixStream;

struct Host {
    root: TempDir,
}

impl Host {
    fn new() -> Self {
        let root = TempDir::new().expect("should create temp dir");
        for dir in ["sys/bus/pci/devices", "sys/class/net", "proc/net", "dev"] {
            fs::create_dir_all(root.path().join(dir)).expect("should create fixture dir");
        }
        fs::write(
            root.path().join("proc/net/route"),
            "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\tMTU\tWindow\tIRTT\n\
             eno1\t00000000\t0102A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n",
        )
        .expect("should write route table");
        Self { root }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn add_nic(&self, addr: &str, vendor: &str, device: &str, driver: &str, if_name: &str) {
        let dir = self.path("sys/bus/pci/devices").join(addr);
        fs::create_dir_all(dir.join("net").join(if_name)).expect("should create device dir");
        fs::write(dir.join("vendor"), format!("0x{vendor}\n")).expect("vendor");
        fs::write(dir.join("device"), format!("0x{device}\n")).expect("device");
        fs::write(dir.join("class"), "0x020000\n").expect("class");

        let driver_dir = self.path("sys/bus/pci/drivers").join(driver);
        fs::create_dir_all(&driver_dir).expect("should create driver dir");
        symlink(&driver_dir, dir.join("driver")).expect("driver link");

        let class_dir = self.path("sys/class/net").join(if_name);
        fs::create_dir_all(&class_dir).expect("should create net class dir");
        fs::write(class_dir.join("type"), "1\n").expect("link type");
    }

    fn write_config(&self, text: &str) -> PathBuf {
        let path = self.path("config.json");
        fs::write(&path, text).expect("should write config");
        path
    }

    fn args(&self, config: &Path) -> DaemonArgs {
        DaemonArgs::try_parse_from([
            "sriovdp".to_string(),
            format!("--config-file={}", config.display()),
            format!("--plugin-registry-dir={}", self.path("plugins_registry").display()),
            format!("--device-plugin-dir={}", self.path("device-plugins").display()),
            format!("--device-info-dir={}", self.path("devinfo").display()),
            format!("--sysfs-root={}", self.path("sys").display()),
            format!("--procfs-root={}", self.path("proc").display()),
            format!("--dev-root={}", self.path("dev").display()),
        ])
        .expect("arguments should parse")
    }
}

async fn request(socket: &Path, line: &str) -> serde_json::Value {
    let stream = UnixStream::connect(socket).await.expect("should connect");
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("should send request");
    let response = BufReader::new(reader)
        .lines()
        .next_line()
        .await
        .expect("should read response")
        .expect("should receive a line");
    serde_json::from_str(&response).expect("response should be json")
}

fn device_ids(response: &serde_json::Value) -> Vec<String> {
    response["devices"]
        .as_array()
        .expect("devices array")
        .iter()
        .map(|d| d["id"].as_str().expect("device id").to_string())
        .collect()
}

#[test(tokio::test)]
async fn vendor_pool_serves_matching_functions_only() {
    let host = Host::new();
    host.add_nic("0000:3b:02.0", "8086", "154c", "iavf", "ens1f0v0");
    host.add_nic("0000:3b:02.1", "8086", "154c", "iavf", "ens1f0v1");
    host.add_nic("0000:5e:00.2", "15b3", "1018", "mlx5_core", "ens2f0v0");
    let config = host.write_config(
        r#"{"resourceList": [
            {"resourceName": "nics", "resourceType": "netdevice", "selectors": {"vendors": ["8086"]}}
        ]}"#,
    );

    let mut daemon = Daemon::new(host.args(&config));
    daemon.start().await.expect("daemon should start");
    assert_eq!(daemon.manager().state(), ManagerState::Serving);

    let socket = host.path("device-plugins/intel.com_nics.sock");
    assert!(socket.exists());

    let listed = request(&socket, r#"{"method":"listAndWatch"}"#).await;
    assert_eq!(device_ids(&listed), vec!["0000:3b:02.0", "0000:3b:02.1"]);

    let allocated = request(
        &socket,
        r#"{"method":"allocate","containerRequests":[{"devicesIds":["0000:3b:02.1"]}]}"#,
    )
    .await;
    assert_eq!(
        allocated["containerResponses"][0]["envs"]["PCIDEVICE_INTEL_COM_NICS"],
        "0000:3b:02.1"
    );
    let info_file = host.path("devinfo/dp-intel.com-nics-0000:3b:02.1-device.json");
    let info: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&info_file).expect("device-info written"))
            .expect("device-info should be json");
    assert_eq!(info["type"], "pci");
    assert_eq!(info["pci"]["pci-address"], "0000:3b:02.1");

    let rejected = request(
        &socket,
        r#"{"method":"allocate","containerRequests":[{"devicesIds":["0000:5e:00.2"]}]}"#,
    )
    .await;
    assert!(rejected["error"].is_string());

    daemon.shutdown().await.expect("should stop");
    daemon.shutdown().await.expect("second stop is a no-op");
    assert_eq!(daemon.manager().state(), ManagerState::Stopped);
    assert!(!socket.exists());
    assert!(!info_file.exists());
}

#[test(tokio::test)]
async fn default_route_function_is_never_served() {
    let host = Host::new();
    host.add_nic("0000:19:00.0", "8086", "1572", "i40e", "eno1");
    host.add_nic("0000:3b:02.0", "8086", "154c", "iavf", "ens1f0v0");
    let config = host.write_config(r#"{"resourceList": [{"resourceName": "all"}]}"#);

    let mut daemon = Daemon::new(host.args(&config));
    daemon.start().await.expect("daemon should start");

    let listed = request(
        &host.path("device-plugins/intel.com_all.sock"),
        r#"{"method":"listAndWatch"}"#,
    )
    .await;
    assert_eq!(device_ids(&listed), vec!["0000:3b:02.0"]);

    daemon.shutdown().await.expect("should stop");
}

#[test(tokio::test)]
async fn invalid_configuration_prevents_serving() {
    let host = Host::new();
    host.add_nic("0000:3b:02.0", "8086", "154c", "iavf", "ens1f0v0");
    let config = host.write_config(
        r#"{"resourceList": [{"resourceName": "nics"}, {"resourceName": "nics"}]}"#,
    );

    let mut daemon = Daemon::new(host.args(&config));

    assert!(daemon.start().await.is_err());
    assert_eq!(daemon.manager().state(), ManagerState::Unconfigured);
    assert!(!host.path("device-plugins").exists());
}
