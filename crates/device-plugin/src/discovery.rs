//! Tenstorrent device discovery.
//!
//! The kernel driver exposes one character device per card under
//! `/dev/tenstorrent/<N>` and reports the card type (e.g. `n150`, `n300`)
//! through `/sys/class/tenstorrent/tenstorrent<N>/tt_card_type`. Cards are
//! grouped by that type, and every group becomes one advertised resource.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::device::Device;

pub const DEFAULT_DEVICE_DIR: &str = "/dev/tenstorrent";
pub const DEFAULT_SYSFS_CLASS_DIR: &str = "/sys/class/tenstorrent";
const CARD_TYPE_ATTRIBUTE: &str = "tt_card_type";

/// Card type -> devices of that type, in enumeration order.
pub type ResourceGroups = BTreeMap<String, Vec<Device>>;

/// Where to look for device nodes and their sysfs attributes.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub device_dir: PathBuf,
    pub sysfs_class_dir: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            sysfs_class_dir: PathBuf::from(DEFAULT_SYSFS_CLASS_DIR),
        }
    }
}

impl DiscoveryConfig {
    /// Path of the attribute file naming the card type of `device_id`.
    pub fn card_type_path(&self, device_id: &str) -> PathBuf {
        self.sysfs_class_dir
            .join(format!("tenstorrent{device_id}"))
            .join(CARD_TYPE_ATTRIBUTE)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to enumerate device directory {path}")]
    Enumerate { path: String },
}

/// Scans the device directory and groups cards by their reported type.
///
/// A card whose attribute file is missing, unreadable or blank is logged and
/// left out; the remaining cards are still discovered. Only failing to list
/// the device directory itself is an error.
pub fn discover(config: &DiscoveryConfig) -> Result<ResourceGroups, Report<DiscoveryError>> {
    let device_dir = &config.device_dir;
    let enumerate_error = || DiscoveryError::Enumerate {
        path: device_dir.display().to_string(),
    };

    // glob silently yields nothing for a missing directory
    fs::read_dir(device_dir).change_context_lazy(enumerate_error)?;

    let dir = device_dir.to_str().ok_or_else(|| {
        Report::new(enumerate_error()).attach_printable("device directory is not valid UTF-8")
    })?;
    let pattern = format!("{}/*", glob::Pattern::escape(dir));
    let entries = glob::glob(&pattern).change_context_lazy(enumerate_error)?;

    let mut groups = ResourceGroups::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping unreadable device node {}: {e}", e.path().display());
                continue;
            }
        };

        let Some(device_id) = path.file_name().and_then(|name| name.to_str()) else {
            warn!("Skipping device node with a non UTF-8 name: {}", path.display());
            continue;
        };

        let card_type_path = config.card_type_path(device_id);
        let card_type = match fs::read_to_string(&card_type_path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                warn!(
                    "Could not read card type for device {device_id} from {}: {e}",
                    card_type_path.display()
                );
                continue;
            }
        };

        if card_type.is_empty() {
            warn!(
                "Card type for device {device_id} is empty in {}, skipping",
                card_type_path.display()
            );
            continue;
        }

        groups
            .entry(card_type)
            .or_default()
            .push(Device::healthy(device_id));
    }

    info!(
        "Discovered {} resource group(s): {}",
        groups.len(),
        summarize(&groups)
    );

    Ok(groups)
}

fn summarize(groups: &ResourceGroups) -> String {
    groups
        .iter()
        .map(|(card_type, devices)| {
            let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
            format!("{card_type}={ids:?}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
