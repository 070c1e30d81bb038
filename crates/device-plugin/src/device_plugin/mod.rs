//! Kubernetes device plugin for Tenstorrent cards.
//!
//! One [`TenstorrentDevicePlugin`] is created per discovered card type. Each
//! instance serves the `v1beta1.DevicePlugin` gRPC service on its own Unix
//! socket inside the kubelet's device plugin directory, then announces itself
//! through the kubelet's `Registration` service.
//!
//! Conceptual documentation:
//! <https://kubernetes.io/docs/concepts/extend-kubernetes/compute-storage-net/device-plugins/>

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    #![allow(clippy::doc_lazy_continuation)]
    tonic::include_proto!("v1beta1");
}

pub mod connectivity;
pub mod registration;
pub mod server;
pub mod service;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::DEFAULT_DEVICE_DIR;

pub use server::PluginServer;
pub use service::DevicePluginService;
pub use service::TenstorrentDevicePlugin;

/// Device plugin API version this plugin was built against.
pub const API_VERSION: &str = "v1beta1";
/// Directory in which the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
/// The kubelet's registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";
pub const RESOURCE_DOMAIN: &str = "tenstorrent.com";
pub const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by every device plugin instance of this process.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Directory holding the kubelet socket and the plugin sockets
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    /// Directory of the device nodes handed to containers
    pub device_dir: PathBuf,
    pub resource_domain: String,
    pub server_start_timeout: Duration,
    pub register_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            device_plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(KUBELET_SOCKET),
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            resource_domain: RESOURCE_DOMAIN.to_string(),
            server_start_timeout: SERVER_START_TIMEOUT,
            register_timeout: REGISTER_TIMEOUT,
        }
    }
}

/// Errors that end the startup of a single device plugin instance.
#[derive(Debug, Error)]
pub enum DevicePluginError {
    #[error("Failed to bind device plugin socket {path}")]
    Bind { path: String },
    #[error("Device plugin server on {path} did not become ready")]
    ServerStart { path: String },
    #[error("Failed to register resource {resource_name} with kubelet")]
    Register { resource_name: String },
    #[error("Device plugin server on {path} stopped with an error")]
    Serve { path: String },
}

/// Socket file name for a card type, unique per resource.
///
/// Anything outside `[A-Za-z0-9._-]` is replaced so a card type can never
/// escape the device plugin directory.
pub fn endpoint_name(card_type: &str) -> String {
    let sanitized: String = card_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("tenstorrent-{sanitized}.sock")
}
