//! State device resolution.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Resolves a device spec to an existing block device.
pub trait DeviceResolver: Send + Sync {
    /// Resolve `spec` to a device path, or `None` when nothing exists.
    fn resolve(&self, spec: &str) -> Option<PathBuf>;
}

/// Resolves against the running system's `/dev`.
#[derive(Debug, Clone)]
pub struct SystemDevices {
    /// Root of the device tree
    dev_root: PathBuf,
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl SystemDevices {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
        }
    }

    /// Map a spec to the path it should appear at.
    ///
    /// `LABEL=x` and `UUID=x` map to the udev `by-label` / `by-uuid` links.
    pub fn candidate_path(&self, spec: &str) -> Option<PathBuf> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }

        if let Some(label) = spec.strip_prefix("LABEL=") {
            Some(self.dev_root.join("disk/by-label").join(label))
        } else if let Some(uuid) = spec.strip_prefix("UUID=") {
            Some(self.dev_root.join("disk/by-uuid").join(uuid))
        } else {
            Some(PathBuf::from(spec))
        }
    }
}

impl DeviceResolver for SystemDevices {
    fn resolve(&self, spec: &str) -> Option<PathBuf> {
        let path = self.candidate_path(spec)?;
        is_block_device(&path).then_some(path)
    }
}

impl<F> DeviceResolver for F
where
    F: Fn(&str) -> Option<PathBuf> + Send + Sync,
{
    fn resolve(&self, spec: &str) -> Option<PathBuf> {
        self(spec)
    }
}

/// Whether `path` (following symlinks) is a block device.
pub fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}
