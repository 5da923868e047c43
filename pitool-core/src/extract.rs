//! Streaming decompression of cached artifacts.
//!
//! Compressed images are read in small fixed chunks and written sequentially,
//! so memory stays bounded no matter how large the uncompressed image is.
//! The format is chosen by file extension: `.xz` (the catalog's format),
//! `.gz`, and `.zst` are supported.

use crate::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

// Decompression chunk size. Small on purpose: the decoder output rate is the
// bottleneck, not syscall count.
const CHUNK_SIZE: usize = 8192;

/// Whether a path carries a recognised compression extension.
pub fn is_compressed(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("xz" | "gz" | "gzip" | "zst" | "zstd")
    )
}

/// The uncompressed twin of a compressed artifact path.
///
/// A pure suffix removal: `os.img.xz` becomes `os.img`. Paths without a
/// recognised compression extension are returned unchanged.
pub fn extracted_path(compressed: &Path) -> PathBuf {
    if is_compressed(compressed) {
        compressed.with_extension("")
    } else {
        compressed.to_path_buf()
    }
}

/// Streams a compressed artifact into `output`.
///
/// Progress is reported against `declared_size`, the uncompressed size the
/// catalog declares for this artifact. The stream itself is not consulted for
/// a total, so the bar is only as accurate as the catalog metadata.
///
/// On any failure (including cancellation) the partial output file is removed
/// before the error propagates, so it can never be mistaken for a complete
/// artifact by a later run.
pub fn decompress<F>(
    compressed: &Path,
    output: &Path,
    declared_size: u64,
    running: Arc<AtomicBool>,
    on_start: impl FnOnce(u64),
    on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    on_start(declared_size);

    let result = stream_decompress(compressed, output, running, on_progress);
    if result.is_err() {
        remove_if_present(output)?;
    }
    result
}

fn stream_decompress<F>(
    compressed: &Path,
    output: &Path,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let input = BufReader::new(File::open(compressed)?);
    let ext = compressed
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let mut reader: Box<dyn Read> = match ext.as_str() {
        "xz" => Box::new(XzDecoder::new(input)),
        "gz" | "gzip" => Box::new(GzDecoder::new(input)),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(input)?),
        other => {
            return Err(Error::Platform(format!(
                "unsupported compression format: .{other}"
            )));
        }
    };

    let mut writer = BufWriter::new(File::create(output)?);
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        written += n as u64;
        on_progress(written);
    }
    writer.flush()?;

    Ok(())
}

/// Removes a file, treating "already absent" as success.
pub(crate) fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn xz_bytes(content: &[u8]) -> Vec<u8> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    fn run() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn extracted_path_strips_compression_suffix() {
        assert_eq!(
            extracted_path(Path::new("/cache/os.img.xz")),
            Path::new("/cache/os.img")
        );
        assert_eq!(
            extracted_path(Path::new("/cache/os.img.zst")),
            Path::new("/cache/os.img")
        );
        assert_eq!(
            extracted_path(Path::new("/cache/os.img")),
            Path::new("/cache/os.img")
        );
    }

    #[test]
    fn decompresses_xz_stream() {
        let dir = tempdir().unwrap();
        let compressed = dir.path().join("payload.img.xz");
        let output = dir.path().join("payload.img");
        let content = b"raspberry pi os image payload".repeat(1000);
        fs::write(&compressed, xz_bytes(&content)).unwrap();

        let mut last = 0;
        decompress(&compressed, &output, content.len() as u64, run(), |_| {}, |done| {
            last = done
        })
        .unwrap();

        assert_eq!(fs::read(&output).unwrap(), content);
        assert_eq!(last, content.len() as u64);
    }

    #[test]
    fn failure_removes_partial_output() {
        let dir = tempdir().unwrap();
        let compressed = dir.path().join("broken.img.xz");
        let output = dir.path().join("broken.img");
        // Truncated xz stream: valid header, missing the rest.
        let mut bytes = xz_bytes(&b"some longer payload to truncate".repeat(4096));
        bytes.truncate(bytes.len() / 2);
        fs::write(&compressed, bytes).unwrap();

        let result = decompress(&compressed, &output, 0, run(), |_| {}, |_| {});
        assert!(result.is_err());
        assert!(!output.exists());
    }

    #[test]
    fn cancellation_removes_partial_output() {
        let dir = tempdir().unwrap();
        let compressed = dir.path().join("cancel.img.xz");
        let output = dir.path().join("cancel.img");
        fs::write(&compressed, xz_bytes(b"payload")).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let result = decompress(&compressed, &output, 0, flag, |_| {}, |_| {});
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!output.exists());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempdir().unwrap();
        let compressed = dir.path().join("image.rar");
        fs::write(&compressed, b"not really").unwrap();
        let output = dir.path().join("image");
        let result = decompress(&compressed, &output, 0, run(), |_| {}, |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn remove_if_present_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, b"x").unwrap();
        remove_if_present(&path).unwrap();
        remove_if_present(&path).unwrap();
    }
}
