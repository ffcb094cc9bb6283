//! Disk and mount-point discovery.
//!
//! The engine persists a filesystem UUID rather than a mount path: removable
//! disks come back at whatever path the desktop session gives them. The only
//! contract the engine needs is UUID -> current mount path (or none while
//! unplugged) and the reverse lookup used when enrolling a disk. The real
//! implementation shells out to `lsblk --fs --json` and walks the device
//! tree; tests substitute a stub resolver.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::warn;

pub trait MountResolver: Send + Sync {
    /// Current mount path for the disk with this filesystem UUID.
    fn resolve_mount(&self, id: &str) -> Option<PathBuf>;

    /// Stable identifier for the disk mounted at this path.
    fn resolve_id(&self, mount_point: &Path) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    /// Newer lsblk reports an array instead of the scalar field.
    #[serde(default)]
    mountpoints: Option<Vec<Option<String>>>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn first_mountpoint(&self) -> Option<&str> {
        if let Some(points) = &self.mountpoints {
            if let Some(point) = points.iter().flatten().next() {
                return Some(point);
            }
        }
        self.mountpoint.as_deref()
    }
}

/// `lsblk`-backed resolver used in production.
#[derive(Debug, Default)]
pub struct LsblkResolver;

impl LsblkResolver {
    fn query() -> Option<String> {
        let output = Command::new("lsblk")
            .arg("--fs")
            .arg("--json")
            .output()
            .map_err(|e| warn!("Failed to run lsblk: {}", e))
            .ok()?;
        if !output.status.success() {
            warn!("lsblk exited with {}", output.status);
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl MountResolver for LsblkResolver {
    fn resolve_mount(&self, id: &str) -> Option<PathBuf> {
        find_mount_in_json(&Self::query()?, id)
    }

    fn resolve_id(&self, mount_point: &Path) -> Option<String> {
        find_id_in_json(&Self::query()?, mount_point)
    }
}

/// Walk the device tree for the mount point of the device with `uuid`.
pub fn find_mount_in_json(json: &str, uuid: &str) -> Option<PathBuf> {
    let parsed: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| warn!("Failed to parse lsblk output: {}", e))
        .ok()?;

    fn walk(devices: &[BlockDevice], uuid: &str) -> Option<PathBuf> {
        for device in devices {
            if device.uuid.as_deref() == Some(uuid) {
                if let Some(point) = device.first_mountpoint() {
                    return Some(PathBuf::from(point));
                }
            }
            if let Some(found) = walk(&device.children, uuid) {
                return Some(found);
            }
        }
        None
    }
    walk(&parsed.blockdevices, uuid)
}

/// Walk the device tree for the UUID of the device mounted at `mount_point`.
pub fn find_id_in_json(json: &str, mount_point: &Path) -> Option<String> {
    let parsed: LsblkOutput = serde_json::from_str(json)
        .map_err(|e| warn!("Failed to parse lsblk output: {}", e))
        .ok()?;

    fn walk(devices: &[BlockDevice], mount_point: &Path) -> Option<String> {
        for device in devices {
            if device
                .first_mountpoint()
                .is_some_and(|point| Path::new(point) == mount_point)
            {
                if let Some(uuid) = &device.uuid {
                    return Some(uuid.clone());
                }
            }
            if let Some(found) = walk(&device.children, mount_point) {
                return Some(found);
            }
        }
        None
    }
    walk(&parsed.blockdevices, mount_point)
}
