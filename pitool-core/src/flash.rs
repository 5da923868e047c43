//! Writes a verified image to a guarded destination device.
//!
//! The write itself is delegated to `dd` against the raw/unbuffered device
//! node, with progress parsed from its stderr. Before anything destructive
//! happens the image is sniffed, the destination re-authorized by the
//! [`DeviceGuard`], exclusive access to the node is claimed, and the injected
//! confirmation callback must approve the operation.
//!
//! There is no capacity pre-check against the destination and no rollback: a
//! failed or interrupted write leaves the device partially written, and a
//! fresh flash from the beginning is the only recovery path.

use crate::device::{StorageDevice, raw_node};
use crate::guard::DeviceGuard;
use crate::platform::PlatformHandler;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// Post-write verification reads in 1 MiB chunks; dd writes in 1 MiB blocks
// via its bs= argument.
const BUFFER_SIZE: usize = 1024 * 1024;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Nodes with a flash currently in progress. Exactly one operation may hold
/// exclusive raw access to a destination at a time; this is an invariant of
/// the pipeline, not an artifact of single-threaded callers.
static IN_FLIGHT: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// How a flash call ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashOutcome {
    /// The image was written (and, if requested, verified).
    Completed,
    /// The confirmation callback declined; nothing was touched.
    Declined,
}

/// Exclusive claim on a destination node, released on drop.
struct NodeClaim {
    node: PathBuf,
}

impl NodeClaim {
    fn acquire(node: &Path) -> Result<Self> {
        let mut in_flight = IN_FLIGHT.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(node.to_path_buf()) {
            return Err(Error::Busy {
                node: node.to_path_buf(),
            });
        }
        Ok(Self {
            node: node.to_path_buf(),
        })
    }
}

impl Drop for NodeClaim {
    fn drop(&mut self) {
        IN_FLIGHT
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.node);
    }
}

/// Writes an image file to a storage device.
///
/// Preconditions checked before any mutation, in order: the image exists and
/// [`looks_like_disk_image`], the guard authorizes the destination against a
/// fresh device query, no other flash holds the node, and `confirm` (called
/// with the device and the image file name) returns `true`. A declined
/// confirmation returns [`FlashOutcome::Declined`] with zero side effects.
/// The confirmation prompt can sit open indefinitely, so the guard runs a
/// second time after approval, immediately before the unmount; a device
/// unplugged or renumbered while the prompt was open is refused.
///
/// The destination is unmounted, then `dd` writes the image to the raw node
/// variant in 1 MiB blocks; `on_write_progress` receives cumulative bytes
/// against the total passed to `on_write_start`. A non-zero `dd` exit
/// surfaces as [`Error::Write`].
///
/// Post-write verification is opt-in via `verify`: the source is re-hashed
/// and compared against a re-read of the destination. Its absence is not a
/// failure.
#[allow(clippy::too_many_arguments)]
pub fn flash<F1, F2>(
    image_path: &Path,
    device: &StorageDevice,
    platform: &dyn PlatformHandler,
    verify: bool,
    running: Arc<AtomicBool>,
    confirm: impl FnOnce(&StorageDevice, &str) -> bool,
    on_write_start: impl FnOnce(u64),
    on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    on_verify_progress: F2,
) -> Result<FlashOutcome>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    if !image_path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("image does not exist: {}", image_path.display()),
        )));
    }
    if !looks_like_disk_image(image_path)? {
        return Err(Error::InvalidImage {
            path: image_path.to_path_buf(),
        });
    }

    DeviceGuard::new(platform).authorize(&device.node)?;
    let _claim = NodeClaim::acquire(&device.node)?;

    write_confirmed(
        image_path,
        device,
        platform,
        verify,
        running,
        confirm,
        on_write_start,
        on_write_progress,
        on_verify_start,
        on_verify_progress,
    )
}

/// The confirmation gate and everything destructive behind it.
#[allow(clippy::too_many_arguments)]
fn write_confirmed<F1, F2>(
    image_path: &Path,
    device: &StorageDevice,
    platform: &dyn PlatformHandler,
    verify: bool,
    running: Arc<AtomicBool>,
    confirm: impl FnOnce(&StorageDevice, &str) -> bool,
    on_write_start: impl FnOnce(u64),
    on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    on_verify_progress: F2,
) -> Result<FlashOutcome>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    let image_name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !confirm(device, &image_name) {
        return Ok(FlashOutcome::Declined);
    }

    // The world may have changed while the prompt was open; re-validate the
    // destination against current state before the first destructive step.
    DeviceGuard::new(platform).authorize(&device.node)?;

    // Exclusive raw access requires nothing mounted from the device.
    platform.unmount(&device.node)?;

    let raw = raw_node(&device.node);
    let image_len = fs::metadata(image_path)?.len();

    on_write_start(image_len);
    run_dd(image_path, &raw, &device.node, running.clone(), on_write_progress)?;

    if verify {
        verify_written(
            image_path,
            &raw,
            &device.node,
            image_len,
            running,
            on_verify_start,
            on_verify_progress,
        )?;
    }

    Ok(FlashOutcome::Completed)
}

/// Whether a file plausibly contains a disk image: either it is itself a
/// block device, or its first sector carries the MBR boot signature.
pub fn looks_like_disk_image(path: &Path) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if fs::metadata(path)?.file_type().is_block_device() {
            return Ok(true);
        }
    }

    let mut file = File::open(path)?;
    let mut sector = [0u8; 512];
    match file.read_exact(&mut sector) {
        Ok(()) => Ok(sector[510..] == MBR_SIGNATURE),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn dd_command(image: &Path, raw: &Path) -> Command {
    #[cfg(target_os = "macos")]
    {
        // The raw node needs root; macOS dd spells the block size "1m".
        let mut command = Command::new("sudo");
        command
            .arg("/bin/dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", raw.display()))
            .arg("bs=1m")
            .arg("status=progress");
        command
    }
    #[cfg(not(target_os = "macos"))]
    {
        let mut command = Command::new("dd");
        command
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", raw.display()))
            .arg("bs=1M")
            .arg("status=progress")
            .arg("conv=fsync");
        command
    }
}

/// The cumulative byte count from a dd progress/summary line
/// ("524288000 bytes (524 MB, 500 MiB) copied, 4 s, 131 MB/s").
fn parse_dd_progress(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    let count = tokens.next()?.parse().ok()?;
    if tokens.next()? == "bytes" { Some(count) } else { None }
}

/// Spawns dd and streams progress from its stderr until it exits.
fn run_dd<F>(
    image: &Path,
    raw: &Path,
    node: &Path,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let mut child = dd_command(image, raw)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child.stderr.take().ok_or_else(|| Error::Write {
        node: node.to_path_buf(),
        reason: "could not capture dd stderr".to_string(),
    })?;

    // dd separates progress updates with carriage returns, not newlines.
    let mut reader = BufReader::new(stderr);
    let mut chunk = Vec::new();
    let mut last_line = String::new();

    loop {
        if !running.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }

        chunk.clear();
        if reader.read_until(b'\r', &mut chunk)? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&chunk);
        for line in text.split(['\r', '\n']) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(bytes) = parse_dd_progress(line) {
                on_progress(bytes);
            }
            last_line = line.to_string();
        }
    }

    if !running.load(Ordering::SeqCst) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(Error::Cancelled);
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(Error::Write {
            node: node.to_path_buf(),
            reason: format!("dd exited with {status}: {last_line}"),
        });
    }
    Ok(())
}

/// Opt-in post-write verification: hashes the source image and the first
/// `image_len` bytes read back from the raw device in lockstep.
fn verify_written<F>(
    image_path: &Path,
    raw: &Path,
    node: &Path,
    image_len: u64,
    running: Arc<AtomicBool>,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let mut image_file = File::open(image_path)?;
    let mut device_file = File::open(raw)?;

    on_start(image_len);

    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();
    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let mut remaining = image_len;
    while remaining > 0 {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_file.read_exact(&mut image_buf[..chunk])?;
        device_file.read_exact(&mut device_buf[..chunk])?;

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        on_progress(image_len - remaining);
    }

    if image_hasher.finalize() != device_hasher.finalize() {
        return Err(Error::Write {
            node: node.to_path_buf(),
            reason: "post-write verification failed: device content does not match the source image"
                .to_string(),
        });
    }
    Ok(())
}
