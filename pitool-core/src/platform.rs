//! The OS-specific collaborator boundary.
//!
//! Everything that requires talking to the operating system about storage
//! devices lives behind the [`PlatformHandler`] trait: enumeration, unmount,
//! eject, and mounting the primary partition. Exactly one implementation is
//! selected at startup by [`native_handler`].
//!
//! Platform implementations report the *full* device set with classification
//! attributes and apply no safety policy of their own. The eligibility filter
//! lives here in the core ([`eligible_devices`]) and the final gate lives in
//! [`crate::guard`], which depends on being able to re-query the unfiltered
//! list.

use crate::Result;
use crate::device::StorageDevice;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
pub(crate) mod linux;

#[cfg(target_os = "macos")]
pub(crate) mod macos;

/// Minimal OS-specific operations the imaging core requires.
pub trait PlatformHandler {
    /// Returns every storage device the OS knows about, unfiltered.
    fn enumerate_storage_devices(&self) -> Result<Vec<StorageDevice>>;

    /// Whether `node` is (or belongs to) the disk hosting the running OS.
    ///
    /// Resolution only; the refusal policy lives in [`crate::guard`].
    /// Implementations must resolve against current state on every call,
    /// never a cached snapshot.
    fn is_system_disk(&self, node: &Path) -> Result<bool>;

    /// Unmounts all mounted filesystems on a device.
    fn unmount(&self, node: &Path) -> Result<()>;

    /// Unmounts and ejects a device so it can be removed.
    fn eject(&self, node: &Path) -> Result<()>;

    /// Mounts the device's primary (boot) partition and returns its mount
    /// point. Used by post-flash provisioning steps.
    fn mount_primary_partition(&self, node: &Path) -> Result<PathBuf>;
}

/// Selects the handler for the host operating system.
pub fn native_handler() -> Result<Box<dyn PlatformHandler>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxPlatform))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::MacOsPlatform))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(crate::Error::Platform(
            "unsupported host operating system".to_string(),
        ))
    }
}

/// Queries the platform and retains only user-selectable devices.
///
/// This is the display/selection filter, not the safety gate; the guard
/// re-runs it against a fresh enumeration before any destructive action.
pub fn eligible_devices(platform: &dyn PlatformHandler) -> Result<Vec<StorageDevice>> {
    let mut devices = platform.enumerate_storage_devices()?;
    devices.retain(StorageDevice::is_eligible);
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPlatform(Vec<StorageDevice>);

    impl PlatformHandler for FixedPlatform {
        fn enumerate_storage_devices(&self) -> Result<Vec<StorageDevice>> {
            Ok(self.0.clone())
        }
        fn is_system_disk(&self, _node: &Path) -> Result<bool> {
            Ok(false)
        }
        fn unmount(&self, _node: &Path) -> Result<()> {
            Ok(())
        }
        fn eject(&self, _node: &Path) -> Result<()> {
            Ok(())
        }
        fn mount_primary_partition(&self, _node: &Path) -> Result<PathBuf> {
            Ok(PathBuf::from("/tmp"))
        }
    }

    fn device(node: &str, protocol: &str, external: bool) -> StorageDevice {
        StorageDevice {
            node: PathBuf::from(node),
            name: "Drive".to_string(),
            size: "16.0 GB".to_string(),
            protocol: protocol.to_string(),
            external,
        }
    }

    #[test]
    fn filters_out_internal_and_non_hotplug_devices() {
        let platform = FixedPlatform(vec![
            device("/dev/sda", "ATA", false),
            device("/dev/sdb", "USB", true),
            device("/dev/nvme0n1", "NVMe", false),
            device("/dev/mmcblk0", "SD", true),
        ]);

        let eligible = eligible_devices(&platform).unwrap();
        let nodes: Vec<_> = eligible.iter().map(|d| d.node.clone()).collect();
        assert_eq!(
            nodes,
            vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/mmcblk0")]
        );
    }
}
