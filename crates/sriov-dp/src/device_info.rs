//! Device-info files read by network-attachment plugins.
//!
//! One JSON document per allocated device, named
//! `dp-<resource name with '/' as '-'>-<device id>-device.json`.

use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use api_types::DeviceInfo;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeviceInfoError {
    #[error("Device-info file {path} already exists")]
    AlreadyExists { path: String },
    #[error("Device-info file {path} could not be accessed")]
    Io { path: String },
    #[error("Device-info file {path} is malformed")]
    Malformed { path: String },
}

pub fn file_name(resource_name: &str, device_id: &str) -> String {
    format!("dp-{}-{}-device.json", resource_name.replace('/', "-"), device_id)
}

pub fn file_path(dir: &Path, resource_name: &str, device_id: &str) -> PathBuf {
    dir.join(file_name(resource_name, device_id))
}

/// Write `info`, refusing to replace an existing file.
pub fn save(
    dir: &Path,
    resource_name: &str,
    device_id: &str,
    info: &DeviceInfo,
) -> Result<PathBuf, Report<DeviceInfoError>> {
    let path = file_path(dir, resource_name, device_id);
    let io_error = || DeviceInfoError::Io {
        path: path.display().to_string(),
    };

    fs::create_dir_all(dir).change_context_lazy(io_error)?;
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(Report::new(DeviceInfoError::AlreadyExists {
                path: path.display().to_string(),
            }));
        }
        Err(e) => return Err(Report::new(e).change_context(io_error())),
    };

    let body = serde_json::to_vec(info).change_context_lazy(io_error)?;
    file.write_all(&body).change_context_lazy(io_error)?;
    debug!(path = %path.display(), "device-info file written");
    Ok(path)
}

/// Read a device-info document. A missing file is `Ok(None)`.
pub fn load(
    dir: &Path,
    resource_name: &str,
    device_id: &str,
) -> Result<Option<DeviceInfo>, Report<DeviceInfoError>> {
    let path = file_path(dir, resource_name, device_id);
    let body = match fs::read(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Report::new(e).change_context(DeviceInfoError::Io {
                path: path.display().to_string(),
            }))
        }
    };

    serde_json::from_slice(&body)
        .map(Some)
        .change_context(DeviceInfoError::Malformed {
            path: path.display().to_string(),
        })
}

/// Remove a device-info file; a missing file is fine.
pub fn clean(
    dir: &Path,
    resource_name: &str,
    device_id: &str,
) -> Result<(), Report<DeviceInfoError>> {
    let path = file_path(dir, resource_name, device_id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(DeviceInfoError::Io {
            path: path.display().to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use api_types::PciDeviceInfo;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn info() -> DeviceInfo {
        DeviceInfo {
            kind: DeviceInfo::TYPE_PCI.to_string(),
            version: DeviceInfo::VERSION.to_string(),
            pci: Some(PciDeviceInfo {
                pci_address: "0000:3b:02.0".to_string(),
                pf_pci_address: "0000:3b:00.0".to_string(),
                rdma_device: String::new(),
            }),
            vdpa: None,
        }
    }

    #[test]
    fn file_name_replaces_slashes() {
        assert_eq!(
            file_name("intel.com/sriov_net", "0000:3b:02.0"),
            "dp-intel.com-sriov_net-0000:3b:02.0-device.json"
        );
    }

    #[test]
    fn save_then_load_and_clean() {
        let dir = TempDir::new().expect("should create temp dir");

        save(dir.path(), "intel.com/nics", "0000:3b:02.0", &info()).expect("should save");
        let loaded = load(dir.path(), "intel.com/nics", "0000:3b:02.0").expect("should load");
        assert_eq!(loaded, Some(info()));

        clean(dir.path(), "intel.com/nics", "0000:3b:02.0").expect("should clean");
        assert_eq!(
            load(dir.path(), "intel.com/nics", "0000:3b:02.0").expect("should load"),
            None
        );
        clean(dir.path(), "intel.com/nics", "0000:3b:02.0").expect("absence is fine");
    }

    #[test]
    fn save_does_not_overwrite() {
        let dir = TempDir::new().expect("should create temp dir");
        save(dir.path(), "intel.com/nics", "0000:3b:02.0", &info()).expect("should save");

        let err = save(dir.path(), "intel.com/nics", "0000:3b:02.0", &info())
            .expect_err("file exists");

        assert!(matches!(
            err.current_context(),
            DeviceInfoError::AlreadyExists { .. }
        ));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().expect("should create temp dir");
        fs::write(
            file_path(dir.path(), "intel.com/nics", "0000:3b:02.0"),
            "{not json",
        )
        .expect("should write file");

        let err = load(dir.path(), "intel.com/nics", "0000:3b:02.0").expect_err("malformed");

        assert!(matches!(
            err.current_context(),
            DeviceInfoError::Malformed { .. }
        ));
    }
}
