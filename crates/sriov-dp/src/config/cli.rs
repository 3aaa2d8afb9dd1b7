use std::path::PathBuf;

use clap::Parser;
use utils::version;

/// SR-IOV network device plugin daemon
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "SRIOVDP_CONFIG_FILE",
        default_value = "/etc/pcidp/config.json",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON device pool config file location"
    )]
    pub config_file: PathBuf,

    #[arg(
        long,
        env = "SRIOVDP_RESOURCE_PREFIX",
        default_value = "intel.com",
        help = "Resource name prefix used for pools that do not set resourcePrefix"
    )]
    pub resource_prefix: String,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/plugins_registry",
        value_hint = clap::ValueHint::DirPath,
        help = "Plugin registration directory; its presence selects registry mode"
    )]
    pub plugin_registry_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Device plugin socket directory used in legacy mode"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "/var/run/k8s.cni.cncf.io/devinfo/dp",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory receiving device-info files of allocated devices"
    )]
    pub device_info_dir: PathBuf,

    #[arg(long, default_value = "/sys", value_hint = clap::ValueHint::DirPath)]
    pub sysfs_root: PathBuf,

    #[arg(long, default_value = "/proc", value_hint = clap::ValueHint::DirPath)]
    pub procfs_root: PathBuf,

    #[arg(long, default_value = "/dev", value_hint = clap::ValueHint::DirPath)]
    pub dev_root: PathBuf,

    #[arg(
        long,
        env = "SRIOVDP_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Also write logs to a daily rotated file in this directory"
    )]
    pub log_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_point_at_kubelet_paths() {
        let args = DaemonArgs::try_parse_from(["sriovdp"]).expect("defaults should parse");

        assert_eq!(args.config_file, PathBuf::from("/etc/pcidp/config.json"));
        assert_eq!(args.resource_prefix, "intel.com");
        assert_eq!(
            args.plugin_registry_dir,
            PathBuf::from("/var/lib/kubelet/plugins_registry")
        );
        assert_eq!(args.log_dir, None);
    }

    #[test]
    fn roots_can_point_at_fixture_tree() {
        let args = DaemonArgs::try_parse_from([
            "sriovdp",
            "--sysfs-root",
            "/tmp/fixture/sys",
            "--resource-prefix",
            "example.com",
        ])
        .expect("flags should parse");

        assert_eq!(args.sysfs_root, PathBuf::from("/tmp/fixture/sys"));
        assert_eq!(args.resource_prefix, "example.com");
    }
}
