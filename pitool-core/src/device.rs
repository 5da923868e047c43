use std::fmt;
use std::path::{Path, PathBuf};

/// Represents a storage device discovered on the system.
///
/// This struct holds cross-platform information about a device, populated by
/// the platform-specific enumeration in [`crate::platform`]. The platform
/// layer reports the *full* device set with classification attributes; it is
/// the core's job (via [`StorageDevice::is_eligible`] and [`crate::guard`]) to
/// decide which devices may be presented for selection or written to.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageDevice {
    /// The authoritative node path used for raw I/O
    /// (e.g., `/dev/disk2` on macOS or `/dev/sdb` on Linux).
    pub node: PathBuf,
    /// A human-readable device or media name (e.g., "SanDisk Ultra").
    pub name: String,
    /// Human-readable capacity string (e.g., "31.9 GB").
    pub size: String,
    /// The bus protocol the device is attached over (e.g., "USB", "SD").
    pub protocol: String,
    /// Whether the device is classified as external/removable by the OS.
    pub external: bool,
}

impl StorageDevice {
    /// Whether this device may be presented for user selection.
    ///
    /// A device is eligible when the OS classifies it as external/removable
    /// *and* it is attached over a hot-pluggable bus. This is a display
    /// filter; the final safety gate is [`crate::guard::DeviceGuard`].
    pub fn is_eligible(&self) -> bool {
        self.external && matches!(self.protocol.as_str(), "USB" | "SD")
    }
}

impl fmt::Display for StorageDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {} | {} ({})",
            self.node.display(),
            self.name,
            self.size,
            self.protocol
        )
    }
}

/// Converts a buffered device node to its raw/unbuffered variant.
///
/// On macOS the buffered `/dev/diskN` node has an unbuffered `/dev/rdiskN`
/// twin that bypasses the block cache and is substantially faster for
/// sequential writes. On platforms without this split (Linux), the node is
/// returned unchanged. The transformation is a fixed prefix rewrite, never
/// a lookup.
pub fn raw_node(node: &Path) -> PathBuf {
    let text = node.to_string_lossy();
    match text.strip_prefix("/dev/disk") {
        Some(rest) => PathBuf::from(format!("/dev/rdisk{rest}")),
        None => node.to_path_buf(),
    }
}

/// Formats a byte count as a short human-readable capacity string.
///
/// Only the Linux enumeration needs this; diskutil already reports a
/// human-readable size on macOS.
#[cfg(target_os = "linux")]
pub(crate) fn format_size(bytes: u64) -> String {
    const GB: f64 = 1e9;
    const MB: f64 = 1e6;
    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.1} GB", bytes / GB)
    } else {
        format!("{:.1} MB", bytes / MB)
    }
}
