//! Content-addressed on-disk cache of downloaded image artifacts.
//!
//! Each catalog entry maps to at most one artifact on disk, keyed by the
//! final path segment of its source URL. [`DownloadCache::acquire`] is the
//! main entry point: it turns an [`ImageDescriptor`] into a verified local
//! image path, downloading, extracting, and hashing only as much as the
//! current cache state requires. A second call for the same descriptor is
//! free once the extracted artifact exists.

use crate::catalog::ImageDescriptor;
use crate::extract::{self, remove_if_present};
use crate::{Error, Result, verify};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Download chunk size, matching the extraction chunk size.
const CHUNK_SIZE: usize = 8192;

/// An on-disk artifact cache rooted at an explicit directory.
///
/// The directory is injected rather than discovered, so tests can point the
/// cache at an isolated temporary directory. The CLI constructs it under the
/// platform's user cache directory.
pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The on-disk path of the compressed artifact for a descriptor.
    pub fn compressed_path(&self, image: &ImageDescriptor) -> Result<PathBuf> {
        Ok(self.dir.join(filename_from_url(&image.url)?))
    }

    /// The on-disk path of the extracted artifact for a descriptor.
    ///
    /// A pure function of the compressed path (compression suffix removal).
    pub fn extracted_path(&self, image: &ImageDescriptor) -> Result<PathBuf> {
        Ok(extract::extracted_path(&self.compressed_path(image)?))
    }

    /// Whether the extracted artifact for a descriptor is already cached.
    pub fn is_cached(&self, image: &ImageDescriptor) -> Result<bool> {
        Ok(self.extracted_path(image)?.exists())
    }

    /// Acquires a verified local copy of an image.
    ///
    /// The cheapest sufficient path is taken:
    /// 1. the extracted artifact exists: return it immediately, no network
    ///    and no CPU work;
    /// 2. the compressed artifact exists: extract and verify, no network;
    /// 3. otherwise: download, extract, verify.
    ///
    /// A failed or cancelled download deletes the partial compressed file
    /// before the error propagates. A digest mismatch purges both artifacts
    /// and surfaces as [`Error::Integrity`]; the caller must re-acquire from
    /// the network. After a successful verification the compressed artifact
    /// is deleted, leaving one file per catalog entry.
    ///
    /// Download and extraction progress are reported against the sizes the
    /// catalog declares, not sizes derived from the streams.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire<F1, F2, F3>(
        &self,
        image: &ImageDescriptor,
        running: Arc<AtomicBool>,
        on_download_start: impl FnOnce(u64),
        on_download_progress: F1,
        on_extract_start: impl FnOnce(u64),
        on_extract_progress: F2,
        on_verify_start: impl FnOnce(u64),
        on_verify_progress: F3,
    ) -> Result<PathBuf>
    where
        F1: FnMut(u64),
        F2: FnMut(u64),
        F3: FnMut(u64),
    {
        let compressed = self.compressed_path(image)?;
        let extracted = self.extracted_path(image)?;

        if extracted.exists() {
            return Ok(extracted);
        }

        fs::create_dir_all(&self.dir)?;

        if !compressed.exists() {
            self.download(
                image,
                &compressed,
                running.clone(),
                on_download_start,
                on_download_progress,
            )?;
        }

        // A catalog entry may serve an uncompressed image directly, in which
        // case the downloaded file already is the extracted artifact.
        if compressed != extracted {
            extract::decompress(
                &compressed,
                &extracted,
                image.extract_size,
                running.clone(),
                on_extract_start,
                on_extract_progress,
            )?;
        }

        let actual = verify::file_sha256(
            &extracted,
            running,
            on_verify_start,
            on_verify_progress,
        )?;
        if actual != image.extract_sha256 {
            self.purge(image)?;
            return Err(Error::Integrity {
                path: extracted,
                expected: image.extract_sha256.clone(),
                actual,
            });
        }

        if compressed != extracted {
            remove_if_present(&compressed)?;
        }

        Ok(extracted)
    }

    /// Deletes both artifacts for a descriptor. Idempotent: artifacts that
    /// are already absent are not an error.
    pub fn purge(&self, image: &ImageDescriptor) -> Result<()> {
        remove_if_present(&self.extracted_path(image)?)?;
        remove_if_present(&self.compressed_path(image)?)?;
        Ok(())
    }

    /// Removes every cached artifact and recreates the cache directory.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Streams the compressed artifact to `dest` in fixed chunks.
    fn download<F>(
        &self,
        image: &ImageDescriptor,
        dest: &Path,
        running: Arc<AtomicBool>,
        on_start: impl FnOnce(u64),
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(u64),
    {
        // Progress runs against the declared compressed size, not the
        // Content-Length header.
        on_start(image.image_download_size);

        let result = (|| {
            let mut response = reqwest::blocking::get(&image.url)
                .and_then(|response| response.error_for_status())
                .map_err(|source| Error::Network {
                    url: image.url.clone(),
                    source,
                })?;

            let mut file = File::create(dest)?;
            let mut buffer = [0u8; CHUNK_SIZE];
            let mut downloaded: u64 = 0;

            loop {
                if !running.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }

                let n = response.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buffer[..n])?;
                downloaded += n as u64;
                on_progress(downloaded);
            }
            file.flush()?;
            Ok(())
        })();

        // A half-downloaded file must never look like a cache hit later.
        if result.is_err() {
            remove_if_present(dest)?;
        }
        result
    }
}

/// Derives the cache key (filename) from a source URL: the final path
/// segment, with any query string stripped.
pub fn filename_from_url(url: &str) -> Result<String> {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
        })
}
