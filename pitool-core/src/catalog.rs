//! Fetches and filters the remote image catalog.
//!
//! The catalog is a single JSON document listing downloadable OS images,
//! possibly nested one or more levels deep under grouping entries with
//! `subitems`. Only images built for cloud-init provisioning of Raspberry Pi
//! OS are exposed; everything else in the document is ignored.

use crate::{Error, Result};
use serde::Deserialize;

/// The imaging-utility OS list, v4 schema.
pub const API_URL: &str = "https://downloads.raspberrypi.org/os_list_imagingutility_v4.json";

/// Only images with this init format carry the cloud-init provisioning hooks
/// the rest of the tool depends on.
const SUPPORTED_INIT_FORMAT: &str = "cloudinit-rpi";

/// Product filter applied to the entry name.
const PRODUCT_MARKER: &str = "Raspberry Pi OS";

/// Immutable metadata identifying one downloadable OS image.
///
/// Created once per catalog fetch and never mutated. The digest and sizes are
/// declared by the catalog, not measured locally; progress reporting is only
/// as accurate as this metadata.
#[derive(Clone, Debug)]
pub struct ImageDescriptor {
    pub name: String,
    pub description: String,
    /// Source URL of the compressed artifact.
    pub url: String,
    /// Expected uncompressed size in bytes.
    pub extract_size: u64,
    /// Expected SHA-256 of the uncompressed artifact, lowercase hex.
    pub extract_sha256: String,
    /// Declared size of the compressed download in bytes.
    pub image_download_size: u64,
    pub release_date: String,
    pub init_format: String,
    /// Device models the image supports.
    pub devices: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OsListDocument {
    #[serde(default)]
    os_list: Vec<OsEntry>,
}

/// One raw catalog entry. Grouping entries carry `subitems` instead of a
/// download URL, so every field is optional at this layer.
#[derive(Debug, Deserialize)]
struct OsEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    extract_size: u64,
    #[serde(default)]
    extract_sha256: String,
    #[serde(default)]
    image_download_size: u64,
    #[serde(default)]
    release_date: String,
    #[serde(default)]
    init_format: String,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    subitems: Vec<OsEntry>,
}

impl OsEntry {
    fn is_supported(&self) -> bool {
        self.name.contains(PRODUCT_MARKER) && self.init_format == SUPPORTED_INIT_FORMAT
    }

    fn into_descriptor(self) -> ImageDescriptor {
        ImageDescriptor {
            name: self.name,
            description: self.description,
            url: self.url,
            extract_size: self.extract_size,
            extract_sha256: self.extract_sha256,
            image_download_size: self.image_download_size,
            release_date: self.release_date,
            init_format: self.init_format,
            devices: self.devices,
            capabilities: self.capabilities,
        }
    }
}

/// Fetches the image catalog and returns the supported descriptors.
///
/// Every descriptor returned has `init_format == "cloudinit-rpi"` and a name
/// containing `"Raspberry Pi OS"`. A fetch or decode failure surfaces as
/// [`Error::Network`]; no retry is attempted.
pub fn fetch_image_list(url: &str) -> Result<Vec<ImageDescriptor>> {
    let document = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.json::<OsListDocument>())
        .map_err(|source| Error::Network {
            url: url.to_string(),
            source,
        })?;

    Ok(descriptors_from(document))
}

fn descriptors_from(document: OsListDocument) -> Vec<ImageDescriptor> {
    let mut result = Vec::new();
    for entry in document.os_list {
        collect(entry, &mut result);
    }
    result
}

fn collect(entry: OsEntry, out: &mut Vec<ImageDescriptor>) {
    if entry.subitems.is_empty() {
        if entry.is_supported() {
            out.push(entry.into_descriptor());
        }
        return;
    }
    for sub in entry.subitems {
        collect(sub, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "os_list": [
            {
                "name": "Raspberry Pi OS (64-bit)",
                "description": "A port of Debian with the Raspberry Pi Desktop",
                "url": "https://downloads.raspberrypi.org/images/os-arm64.img.xz",
                "extract_size": 4294967296,
                "extract_sha256": "ab12cd34",
                "image_download_size": 1198765432,
                "release_date": "2025-05-06",
                "init_format": "cloudinit-rpi",
                "devices": ["pi5-64bit", "pi4-64bit"],
                "capabilities": ["ssh", "cloudinit"]
            },
            {
                "name": "Raspberry Pi OS (legacy)",
                "url": "https://downloads.raspberrypi.org/images/legacy.img.xz",
                "init_format": "systemd",
                "release_date": "2024-01-01"
            },
            {
                "name": "Other distributions",
                "subitems": [
                    {
                        "name": "Raspberry Pi OS Lite (64-bit)",
                        "url": "https://downloads.raspberrypi.org/images/lite.img.xz",
                        "extract_size": 2147483648,
                        "extract_sha256": "ef56ab78",
                        "image_download_size": 498765432,
                        "release_date": "2025-05-06",
                        "init_format": "cloudinit-rpi"
                    },
                    {
                        "name": "Ubuntu Server",
                        "url": "https://example.com/ubuntu.img.xz",
                        "init_format": "cloudinit-rpi"
                    }
                ]
            }
        ]
    }"#;

    fn sample_descriptors() -> Vec<ImageDescriptor> {
        let document: OsListDocument = serde_json::from_str(SAMPLE).unwrap();
        descriptors_from(document)
    }

    #[test]
    fn keeps_only_cloudinit_raspberry_pi_entries() {
        let descriptors = sample_descriptors();
        assert_eq!(descriptors.len(), 2);
        for descriptor in &descriptors {
            assert_eq!(descriptor.init_format, SUPPORTED_INIT_FORMAT);
            assert!(descriptor.name.contains(PRODUCT_MARKER));
        }
    }

    #[test]
    fn walks_nested_subitems() {
        let descriptors = sample_descriptors();
        assert!(
            descriptors
                .iter()
                .any(|d| d.name == "Raspberry Pi OS Lite (64-bit)")
        );
    }

    #[test]
    fn maps_descriptor_fields() {
        let descriptors = sample_descriptors();
        let full = &descriptors[0];
        assert_eq!(full.url, "https://downloads.raspberrypi.org/images/os-arm64.img.xz");
        assert_eq!(full.extract_size, 4_294_967_296);
        assert_eq!(full.extract_sha256, "ab12cd34");
        assert_eq!(full.image_download_size, 1_198_765_432);
        assert_eq!(full.release_date, "2025-05-06");
        assert_eq!(full.devices, vec!["pi5-64bit", "pi4-64bit"]);
        assert_eq!(full.capabilities, vec!["ssh", "cloudinit"]);
    }

    #[test]
    fn tolerates_missing_fields() {
        let document: OsListDocument =
            serde_json::from_str(r#"{"os_list":[{"name":"Raspberry Pi OS","init_format":"cloudinit-rpi"}]}"#)
                .unwrap();
        let descriptors = descriptors_from(document);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].extract_size, 0);
        assert!(descriptors[0].devices.is_empty());
    }

    #[test]
    fn empty_document_yields_no_descriptors() {
        let document: OsListDocument = serde_json::from_str("{}").unwrap();
        assert!(descriptors_from(document).is_empty());
    }
}
