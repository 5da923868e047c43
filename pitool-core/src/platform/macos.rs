use crate::device::StorageDevice;
use crate::platform::PlatformHandler;
use crate::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

pub(crate) struct MacOsPlatform;

/// Extracts the value of a `Key:   value` field from diskutil output.
fn info_field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(value) = rest.trim_start().strip_prefix(':') {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Whole-disk nodes from `diskutil list` output (the `/dev/diskN` header
/// lines, partitions excluded).
fn whole_disk_nodes(listing: &str) -> Vec<PathBuf> {
    listing
        .lines()
        .filter(|line| line.starts_with("/dev/disk"))
        .filter_map(|line| line.split_whitespace().next())
        .map(|token| PathBuf::from(token.trim_end_matches(':')))
        .collect()
}

/// Builds a [`StorageDevice`] from `diskutil info` output.
fn device_from_info(node: &Path, info: &str) -> StorageDevice {
    // "Disk Size: 31.9 GB (31914983424 Bytes) (exactly ...)" - keep the
    // human-readable prefix.
    let size = info_field(info, "Disk Size")
        .map(|value| match value.split_once('(') {
            Some((prefix, _)) => prefix.trim().to_string(),
            None => value.to_string(),
        })
        .unwrap_or_else(|| "unknown".to_string());

    StorageDevice {
        node: info_field(info, "Device Node")
            .map(PathBuf::from)
            .unwrap_or_else(|| node.to_path_buf()),
        name: info_field(info, "Device / Media Name")
            .unwrap_or("Unknown")
            .to_string(),
        size,
        protocol: info_field(info, "Protocol").unwrap_or("Unknown").to_string(),
        external: info_field(info, "Device Location") == Some("External"),
    }
}

/// The `diskXsY` identifier of the cloud-init boot partition in
/// `diskutil list <node>` output (the partition whose volume name is
/// `bootfs`).
fn bootfs_identifier(listing: &str) -> Option<&str> {
    listing
        .lines()
        .find(|line| line.contains("bootfs"))
        .and_then(|line| line.split_whitespace().last())
        .filter(|token| token.starts_with("disk"))
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

fn diskutil<I, S>(args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_checked("diskutil", args)
}

impl PlatformHandler for MacOsPlatform {
    /// Reports every whole disk `diskutil` knows about, including internal
    /// ones; classification is carried in the attributes and the safety
    /// decisions happen in the core.
    fn enumerate_storage_devices(&self) -> Result<Vec<StorageDevice>> {
        let listing = diskutil(["list"])?;
        let mut devices = Vec::new();

        for node in whole_disk_nodes(&listing) {
            let info = diskutil([OsStr::new("info"), node.as_os_str()])?;
            devices.push(device_from_info(&node, &info));
        }

        Ok(devices)
    }

    /// The boot disk is always `disk0`; any node containing it (including
    /// the raw `rdisk0` variant and its partitions) counts.
    fn is_system_disk(&self, node: &Path) -> Result<bool> {
        Ok(node.to_string_lossy().contains("disk0"))
    }

    fn unmount(&self, node: &Path) -> Result<()> {
        diskutil([OsStr::new("unmountDisk"), node.as_os_str()])?;
        Ok(())
    }

    fn eject(&self, node: &Path) -> Result<()> {
        diskutil([OsStr::new("eject"), node.as_os_str()])?;
        Ok(())
    }

    /// Mounts the flashed device's partitions and returns the mount point of
    /// the `bootfs` boot partition.
    fn mount_primary_partition(&self, node: &Path) -> Result<PathBuf> {
        diskutil([OsStr::new("mountDisk"), node.as_os_str()])?;

        let listing = diskutil([OsStr::new("list"), node.as_os_str()])?;
        let partition = bootfs_identifier(&listing).ok_or_else(|| {
            Error::Platform(format!("no boot partition found on {}", node.display()))
        })?;

        let info = diskutil(["info", partition])?;
        if info_field(&info, "Mounted") != Some("Yes") {
            return Err(Error::Platform(format!(
                "boot partition {partition} is not mounted"
            )));
        }
        info_field(&info, "Mount Point")
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::Platform(format!("no mount point reported for {partition}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = "\
   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Whole:                     Yes
   Part of Whole:             disk4
   Device / Media Name:       SanDisk Ultra

   Volume Name:               Not applicable (no file system)
   Mounted:                   Not applicable (no file system)

   Protocol:                  USB
   Disk Size:                 31.9 GB (31914983424 Bytes) (exactly 62333952 512-Byte-Units)
   Device Location:           External
";

    const LISTING: &str = "\
/dev/disk0 (internal, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *500.3 GB   disk0
   1:             Apple_APFS_ISC Container disk1         524.3 MB   disk0s1

/dev/disk4 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:     FDisk_partition_scheme                        *31.9 GB    disk4
   1:             Windows_FAT_32 bootfs                  536.9 MB   disk4s1
   2:                      Linux                         31.4 GB    disk4s2
";

    #[test]
    fn parses_info_fields() {
        assert_eq!(info_field(INFO, "Device Node"), Some("/dev/disk4"));
        assert_eq!(info_field(INFO, "Protocol"), Some("USB"));
        assert_eq!(info_field(INFO, "Device Location"), Some("External"));
        assert_eq!(info_field(INFO, "Nonexistent"), None);
    }

    #[test]
    fn builds_device_from_info() {
        let device = device_from_info(Path::new("/dev/disk4"), INFO);
        assert_eq!(device.node, Path::new("/dev/disk4"));
        assert_eq!(device.name, "SanDisk Ultra");
        assert_eq!(device.size, "31.9 GB");
        assert_eq!(device.protocol, "USB");
        assert!(device.external);
        assert!(device.is_eligible());
    }

    #[test]
    fn lists_whole_disks_only() {
        assert_eq!(
            whole_disk_nodes(LISTING),
            vec![PathBuf::from("/dev/disk0"), PathBuf::from("/dev/disk4")]
        );
    }

    #[test]
    fn recognizes_disk0_in_every_spelling() {
        let platform = MacOsPlatform;
        assert!(platform.is_system_disk(Path::new("/dev/disk0")).unwrap());
        assert!(platform.is_system_disk(Path::new("/dev/rdisk0")).unwrap());
        assert!(platform.is_system_disk(Path::new("/dev/disk0s2")).unwrap());
        assert!(!platform.is_system_disk(Path::new("/dev/disk2")).unwrap());
    }

    #[test]
    fn finds_the_bootfs_partition() {
        assert_eq!(bootfs_identifier(LISTING), Some("disk4s1"));
        assert_eq!(bootfs_identifier("no matching line"), None);
    }
}
