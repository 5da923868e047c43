use crate::device::{StorageDevice, format_size};
use crate::platform::PlatformHandler;
use crate::{Error, Result};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub(crate) struct LinuxPlatform;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to resolve the system drive's whole-disk node.
pub(crate) fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// The whole-disk node backing the root filesystem.
///
/// Resolved fresh on every call; the guard's denylist depends on this never
/// being cached across a selection/execution gap.
pub(crate) fn system_disk_parent() -> Result<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev/").join(disk.name());
            return Ok(parent_device_path(&path));
        }
    }
    Err(Error::Platform(
        "could not determine the system drive".to_string(),
    ))
}

/// Classifies the bus protocol from the device's resolved sysfs path.
///
/// `/sys/block/<name>` is a symlink into the device topology; USB-attached
/// devices pass through a `/usb*/` hub segment and SD cards through `/mmc*`.
fn protocol_from_sysfs_path(resolved: &str) -> &'static str {
    if resolved.contains("/usb") {
        "USB"
    } else if resolved.contains("/mmc") {
        "SD"
    } else if resolved.contains("/nvme") {
        "NVMe"
    } else {
        "ATA"
    }
}

/// The node of partition `index` on a device (e.g., sda -> sda1,
/// mmcblk0 -> mmcblk0p1).
fn partition_node(node: &Path, index: u32) -> PathBuf {
    let text = node.to_string_lossy();
    if text.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{text}p{index}"))
    } else {
        PathBuf::from(format!("{text}{index}"))
    }
}

/// Extracts the mount point from `udisksctl mount` output
/// ("Mounted /dev/sdb1 at /run/media/user/bootfs.").
fn parse_udisksctl_mount(output: &str) -> Option<PathBuf> {
    let (_, tail) = output.split_once(" at ")?;
    let mount_point = tail.trim().trim_end_matches('.');
    if mount_point.is_empty() {
        None
    } else {
        Some(PathBuf::from(mount_point))
    }
}

fn run_checked<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(Error::Platform(format!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl PlatformHandler for LinuxPlatform {
    /// Scans /sys/block and reports every physical block device.
    ///
    /// Pseudo devices (loop, ram, zram, device-mapper) and empty card reader
    /// slots (size zero) are skipped; everything else is reported with its
    /// classification attributes. No safety filtering happens here.
    fn enumerate_storage_devices(&self) -> Result<Vec<StorageDevice>> {
        let mut devices = Vec::new();
        let block_dir = fs::read_dir("/sys/block")?;

        for entry in block_dir.filter_map(std::result::Result::ok) {
            let device_name = entry.file_name().to_string_lossy().to_string();

            if device_name.starts_with("loop")
                || device_name.starts_with("ram")
                || device_name.starts_with("zram")
                || device_name.starts_with("dm-")
            {
                continue;
            }

            let size_sectors = read_sys_file(&device_name, "size")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if size_sectors == 0 {
                continue;
            }

            let external = read_sys_file(&device_name, "removable")
                .map(|s| s == "1")
                .unwrap_or(false);

            let resolved = fs::canonicalize(entry.path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let protocol = protocol_from_sysfs_path(&resolved).to_string();

            let name = read_sys_file(&device_name, "device/model")
                .ok()
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| device_name.clone());

            devices.push(StorageDevice {
                node: PathBuf::from("/dev/").join(&device_name),
                name,
                size: format_size(size_sectors * 512),
                protocol,
                external,
            });
        }

        Ok(devices)
    }

    /// Whether the node (or its whole-disk parent) matches the freshly
    /// resolved parent of the root filesystem's device.
    fn is_system_disk(&self, node: &Path) -> Result<bool> {
        let system = system_disk_parent()?;
        Ok(node == system.as_path() || parent_device_path(node) == system)
    }

    /// Unmounts every mounted filesystem backed by a partition of `node`.
    fn unmount(&self, node: &Path) -> Result<()> {
        let device_name = node
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Platform(format!("invalid device node: {}", node.display())))?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        for disk in disks.iter() {
            let disk_name = disk.name().to_string_lossy();
            // sysinfo reports either "sdb1" or "/dev/sdb1" depending on source.
            if disk_name.trim_start_matches("/dev/").starts_with(&device_name) {
                run_checked("umount", [disk.mount_point().as_os_str()])?;
            }
        }
        Ok(())
    }

    fn eject(&self, node: &Path) -> Result<()> {
        run_checked("eject", [node.as_os_str()])?;
        Ok(())
    }

    fn mount_primary_partition(&self, node: &Path) -> Result<PathBuf> {
        let partition = partition_node(node, 1);
        let output = run_checked(
            "udisksctl",
            [OsStr::new("mount"), OsStr::new("-b"), partition.as_os_str()],
        )?;
        parse_udisksctl_mount(&output).ok_or_else(|| {
            Error::Platform(format!(
                "could not parse mount point for {}",
                partition.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_scsi_partition() {
        assert_eq!(
            parent_device_path(Path::new("/dev/sda1")),
            Path::new("/dev/sda")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/sdb")),
            Path::new("/dev/sdb")
        );
    }

    #[test]
    fn parent_of_nvme_and_mmc_partitions() {
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1p2")),
            Path::new("/dev/nvme0n1")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0p1")),
            Path::new("/dev/mmcblk0")
        );
    }

    #[test]
    fn partition_naming() {
        assert_eq!(partition_node(Path::new("/dev/sdb"), 1), Path::new("/dev/sdb1"));
        assert_eq!(
            partition_node(Path::new("/dev/mmcblk0"), 1),
            Path::new("/dev/mmcblk0p1")
        );
        assert_eq!(
            partition_node(Path::new("/dev/nvme0n1"), 1),
            Path::new("/dev/nvme0n1p1")
        );
    }

    #[test]
    fn protocol_classification() {
        assert_eq!(
            protocol_from_sysfs_path("/sys/devices/pci0000:00/0000:00:14.0/usb2/2-1/host6/target6:0:0/6:0:0:0/block/sdb"),
            "USB"
        );
        assert_eq!(
            protocol_from_sysfs_path("/sys/devices/platform/soc/fe340000.mmc/mmc_host/mmc0/mmc0:aaaa/block/mmcblk0"),
            "SD"
        );
        assert_eq!(
            protocol_from_sysfs_path("/sys/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda"),
            "ATA"
        );
    }

    #[test]
    fn recognizes_the_resolved_system_disk() {
        let platform = LinuxPlatform;
        // Only meaningful where the root device can be resolved; elsewhere
        // the error branch is what the guard turns into a refusal.
        if let Ok(system) = system_disk_parent() {
            assert!(platform.is_system_disk(&system).unwrap());
        }
        match platform.is_system_disk(Path::new("/dev/pitool-test-nonexistent")) {
            Ok(system) => assert!(!system),
            Err(Error::Platform(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn udisksctl_mount_point_parsing() {
        assert_eq!(
            parse_udisksctl_mount("Mounted /dev/sdb1 at /run/media/user/bootfs."),
            Some(PathBuf::from("/run/media/user/bootfs"))
        );
        assert_eq!(
            parse_udisksctl_mount("Mounted /dev/sdb1 at /run/media/user/bootfs"),
            Some(PathBuf::from("/run/media/user/bootfs"))
        );
        assert_eq!(parse_udisksctl_mount("nonsense"), None);
    }
}
