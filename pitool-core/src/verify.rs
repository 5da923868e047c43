//! Streaming SHA-256 digests over arbitrarily large files.
//!
//! Images routinely run to several gigabytes, so hashing always happens in
//! bounded sequential reads; memory use is constant regardless of file size.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Use a 1 MiB buffer for hashing reads.
const BUFFER_SIZE: usize = 1024 * 1024;

/// Computes the SHA-256 digest of a file as a lowercase hex string.
///
/// # Arguments
///
/// * `path` - The file to hash.
/// * `running` - Shared cancellation flag; clearing it aborts with
///   [`Error::Cancelled`].
/// * `on_start` - Called once with the total number of bytes to hash.
/// * `on_progress` - Called repeatedly with the cumulative bytes hashed.
pub fn file_sha256<F>(
    path: &Path,
    running: Arc<AtomicBool>,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<String>
where
    F: FnMut(u64),
{
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    on_start(total);

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut hashed: u64 = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        hashed += n as u64;
        on_progress(hashed);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Checks a file's content against an expected lowercase hex SHA-256 digest.
///
/// The comparison is case-sensitive; catalog digests are lowercase hex and
/// [`file_sha256`] produces lowercase hex.
pub fn verify<F>(
    path: &Path,
    expected: &str,
    running: Arc<AtomicBool>,
    on_start: impl FnOnce(u64),
    on_progress: F,
) -> Result<bool>
where
    F: FnMut(u64),
{
    let actual = file_sha256(path, running, on_start, on_progress)?;
    Ok(actual == expected)
}
