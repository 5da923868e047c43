//! The core, UI-agnostic library for the `pitool` imaging utility.
//!
//! `pitool-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `pitool`) or a graphical user interface.
//! It handles the complexities of fetching image metadata, cached downloads,
//! streaming decompression, SHA-256 verification, device discovery, and the
//! guarded raw write to a destination device.
//!
//! The library is structured into several key modules:
//! - [`catalog`]: Fetches and filters the remote image list into typed
//!   [`catalog::ImageDescriptor`]s.
//! - [`cache`]: A content-addressed on-disk cache that turns a descriptor into
//!   a verified local image path.
//! - [`extract`]: Streaming decompression of cached artifacts.
//! - [`verify`]: Streaming SHA-256 digests over arbitrarily large files.
//! - [`device`]: The cross-platform [`device::StorageDevice`] struct.
//! - [`platform`]: The OS-specific [`platform::PlatformHandler`] boundary
//!   (device enumeration, unmount, eject, mount).
//! - [`guard`]: Re-validates destination safety immediately before any
//!   destructive action.
//! - [`flash`]: Writes a verified image to a guarded device.
//!
//! All long-running operations report progress via callbacks and accept a
//! shared cancellation flag, so the calling application can display progress
//! and interrupt work in any way it chooses.
//!
//! ## Example: Acquiring and Flashing an Image
//!
//! ```rust,no_run
//! use pitool_core::cache::DownloadCache;
//! use pitool_core::{catalog, flash, platform};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> pitool_core::Result<()> {
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let images = catalog::fetch_image_list(catalog::API_URL)?;
//!     let image = images.first().expect("no images available");
//!
//!     let cache = DownloadCache::new(PathBuf::from("/tmp/pitool-cache"));
//!     let image_path = cache.acquire(
//!         image,
//!         running.clone(),
//!         |total| println!("downloading {total} bytes"),
//!         |done| println!("{done} bytes downloaded"),
//!         |_| {},
//!         |_| {},
//!         |_| {},
//!         |_| {},
//!     )?;
//!
//!     let handler = platform::native_handler()?;
//!     let devices = platform::eligible_devices(handler.as_ref())?;
//!     let device = devices.first().expect("no removable devices found");
//!
//!     flash::flash(
//!         &image_path,
//!         device,
//!         handler.as_ref(),
//!         false, // post-write verification is opt-in
//!         running,
//!         |dev, img| {
//!             println!("about to erase {} with {img}", dev.node.display());
//!             true
//!         },
//!         |total| println!("writing {total} bytes"),
//!         |done| println!("{done} bytes written"),
//!         |_| {},
//!         |_| {},
//!     )?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod device;
pub mod extract;
pub mod flash;
pub mod guard;
pub mod platform;
pub mod verify;

use std::path::PathBuf;

/// Errors produced by the imaging pipeline.
///
/// Each variant maps to a distinct user-visible failure. None of them are
/// retried automatically; every failure carries enough context (node, path,
/// digest) for the caller to decide the next action.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Catalog fetch or artifact download failed. Any partial download has
    /// already been deleted when this surfaces.
    #[error("network error while fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A cached artifact's digest did not match the descriptor. The cache
    /// entry has been purged; re-acquire from the network.
    #[error("integrity check failed for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The destination was rejected by the safety guard. Nothing was touched.
    #[error("refusing to touch {}: {reason}", node.display())]
    Safety { node: PathBuf, reason: String },

    /// The raw write (or the opt-in post-write verification) failed. The
    /// destination's content is undefined; a fresh flash is the only recovery.
    #[error("write to {} failed: {reason}", node.display())]
    Write { node: PathBuf, reason: String },

    /// Another flash operation currently holds exclusive access to this node.
    #[error("another flash operation is already using {}", node.display())]
    Busy { node: PathBuf },

    /// The source file does not look like a disk image.
    #[error("{} does not look like a disk image", path.display())]
    InvalidImage { path: PathBuf },

    /// A descriptor's source URL has no usable filename component.
    #[error("image URL has no filename component: {url}")]
    InvalidUrl { url: String },

    /// The operation was cancelled via the shared cancellation flag.
    #[error("operation cancelled by user")]
    Cancelled,

    /// An OS-specific collaborator call (diskutil, umount, ...) failed.
    #[error("platform call failed: {0}")]
    Platform(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
