//! The final safety gate before destructive device operations.
//!
//! Selection menus filter devices for display, but selection and execution
//! are separated by time: devices can be unplugged, re-plugged, and
//! renumbered in between. [`DeviceGuard::authorize`] therefore re-validates
//! the destination against *freshly queried* state immediately before every
//! unmount or flash, and unconditionally refuses the host's own system disk.
//! The denylist is hard-coded on purpose; there is no configuration that
//! weakens it.

use crate::device::StorageDevice;
use crate::platform::{self, PlatformHandler};
use crate::{Error, Result};
use std::path::Path;

pub struct DeviceGuard<'a> {
    platform: &'a dyn PlatformHandler,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(platform: &'a dyn PlatformHandler) -> Self {
        Self { platform }
    }

    /// Authorizes `node` as a destination for a destructive operation.
    ///
    /// Two independent checks, both against current state:
    /// 1. the platform does not resolve `node` to the primary/system disk;
    /// 2. `node` appears in a just-queried eligible-device list.
    ///
    /// Either failure returns [`Error::Safety`] with zero side effects. A
    /// platform that cannot resolve its system disk fails the first check,
    /// not passes it.
    pub fn authorize(&self, node: &Path) -> Result<()> {
        if self.platform.is_system_disk(node)? {
            return Err(Error::Safety {
                node: node.to_path_buf(),
                reason: "node is the primary system disk".to_string(),
            });
        }

        let eligible = platform::eligible_devices(self.platform)?;
        authorize_against(node, &eligible)
    }
}

/// The eligibility half of the check, factored out so it is testable
/// against an arbitrary device list.
fn authorize_against(node: &Path, eligible: &[StorageDevice]) -> Result<()> {
    if eligible.iter().any(|device| device.node == node) {
        Ok(())
    } else {
        Err(Error::Safety {
            node: node.to_path_buf(),
            reason: "node is not in the current eligible device list".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FakePlatform {
        devices: Vec<StorageDevice>,
        system_node: Option<PathBuf>,
    }

    impl PlatformHandler for FakePlatform {
        fn enumerate_storage_devices(&self) -> Result<Vec<StorageDevice>> {
            Ok(self.devices.clone())
        }
        fn is_system_disk(&self, node: &Path) -> Result<bool> {
            Ok(self.system_node.as_deref() == Some(node))
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

    fn usb_device(node: &str) -> StorageDevice {
        StorageDevice {
            node: PathBuf::from(node),
            name: "USB Drive".to_string(),
            size: "32.0 GB".to_string(),
            protocol: "USB".to_string(),
            external: true,
        }
    }

    #[test]
    fn accepts_a_listed_node() {
        let eligible = vec![usb_device("/dev/sdb"), usb_device("/dev/sdc")];
        assert!(authorize_against(Path::new("/dev/sdc"), &eligible).is_ok());
    }

    #[test]
    fn rejects_a_node_missing_from_the_fresh_list() {
        // The device was eligible earlier in the session but has since been
        // unplugged or renumbered.
        let eligible = vec![usb_device("/dev/sdb")];
        let result = authorize_against(Path::new("/dev/sdc"), &eligible);
        assert!(matches!(result, Err(Error::Safety { .. })));
    }

    #[test]
    fn rejects_everything_when_no_devices_are_eligible() {
        let result = authorize_against(Path::new("/dev/sdb"), &[]);
        assert!(matches!(result, Err(Error::Safety { .. })));
    }

    #[test]
    fn authorizes_a_listed_external_node() {
        let platform = FakePlatform {
            devices: vec![usb_device("/dev/sdb")],
            system_node: Some(PathBuf::from("/dev/sda")),
        };
        let guard = DeviceGuard::new(&platform);
        assert!(guard.authorize(Path::new("/dev/sdb")).is_ok());
    }

    #[test]
    fn refuses_the_system_disk_even_when_listed() {
        // A misclassified enumeration must not override the denylist.
        let platform = FakePlatform {
            devices: vec![usb_device("/dev/sda")],
            system_node: Some(PathBuf::from("/dev/sda")),
        };
        let guard = DeviceGuard::new(&platform);
        let result = guard.authorize(Path::new("/dev/sda"));
        assert!(matches!(result, Err(Error::Safety { .. })));
    }
}
