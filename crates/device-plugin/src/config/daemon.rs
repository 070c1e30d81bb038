use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::device_plugin::PluginConfig;
use crate::device_plugin::DEVICE_PLUGIN_PATH;
use crate::device_plugin::KUBELET_SOCKET;
use crate::device_plugin::RESOURCE_DOMAIN;
use crate::discovery::DiscoveryConfig;
use crate::discovery::DEFAULT_DEVICE_DIR;
use crate::discovery::DEFAULT_SYSFS_CLASS_DIR;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "TT_DEVICE_DIR",
        default_value = DEFAULT_DEVICE_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory of the Tenstorrent device nodes, one per card"
    )]
    pub device_dir: PathBuf,

    #[arg(
        long,
        env = "TT_SYSFS_CLASS_DIR",
        default_value = DEFAULT_SYSFS_CLASS_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs class directory exposing tenstorrent<N>/tt_card_type"
    )]
    pub sysfs_class_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory in which plugin sockets are created"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = KUBELET_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "TT_RESOURCE_DOMAIN",
        default_value = RESOURCE_DOMAIN,
        help = "Domain prefix of the advertised resource names, e.g. tenstorrent.com/n150"
    )]
    pub resource_domain: String,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds to wait for a plugin's gRPC server to become reachable"
    )]
    pub server_start_timeout_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for the kubelet registration socket"
    )]
    pub register_timeout_secs: u64,

    #[arg(
        long,
        env = "TT_LOG_LEVEL",
        default_value = "info",
        help = "Log level used when RUST_LOG is not set (error, warn, info, debug, trace)"
    )]
    pub log_level: LevelFilter,
}

impl From<&DaemonArgs> for DiscoveryConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            device_dir: args.device_dir.clone(),
            sysfs_class_dir: args.sysfs_class_dir.clone(),
        }
    }
}

impl From<&DaemonArgs> for PluginConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            device_plugin_dir: args.device_plugin_dir.clone(),
            kubelet_socket: args.kubelet_socket.clone(),
            device_dir: args.device_dir.clone(),
            resource_domain: args.resource_domain.clone(),
            server_start_timeout: Duration::from_secs(args.server_start_timeout_secs),
            register_timeout: Duration::from_secs(args.register_timeout_secs),
        }
    }
}
