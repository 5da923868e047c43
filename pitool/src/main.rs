use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use pitool_core::cache::DownloadCache;
use pitool_core::catalog::{self, ImageDescriptor};
use pitool_core::device::StorageDevice;
use pitool_core::flash::{self, FlashOutcome};
use pitool_core::guard::DeviceGuard;
use pitool_core::platform;
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "pitool")]
#[command(about = "Download, verify, and flash Raspberry Pi OS images", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a Raspberry Pi OS image and flash it to a removable device
    Flash {
        /// Verify the written device against the source image afterwards
        #[arg(long)]
        verify: bool,

        /// Clear the download cache before acquiring the image
        #[arg(long = "clear-cache")]
        clear_cache: bool,
    },
    /// List removable devices available for flashing
    List,
    /// List the available Raspberry Pi OS images
    Images,
    /// Clear the download cache
    ClearCache,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it gives a cleaner exit when the user cancels an operation.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            if let Ok(original_termios) = Termios::from_fd(fd) {
                let mut new_termios = original_termios;
                // Disable printing of control characters.
                new_termios.c_lflag &= !ECHOCTL;

                if tcsetattr(fd, TCSANOW, &new_termios).is_ok() {
                    Self {
                        original_termios: Some(original_termios),
                    }
                } else {
                    Self {
                        original_termios: None,
                    }
                }
            } else {
                Self {
                    original_termios: None,
                }
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn byte_progress_bar(prefix: &'static str, color: &str) -> ProgressBar {
    // No length until the stage's start callback fires; a stage that never
    // runs (cache hit, uncompressed image) leaves its bar undrawn.
    let bar = ProgressBar::no_length();
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))
            .unwrap()
            .progress_chars("■ "),
    );
    bar
}

/// Finishes a stage bar with a message, but only if the stage ever started.
fn finish_stage(bar: &ProgressBar, message: &'static str) {
    if bar.length().is_some() && !bar.is_finished() {
        bar.finish_with_message(message);
    }
}

fn open_cache() -> Result<DownloadCache> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("could not determine the user cache directory"))?
        .join("pitool");
    Ok(DownloadCache::new(dir))
}

/// Presents an interactive menu for the user to select an image.
fn select_image(images: &[ImageDescriptor]) -> Result<ImageDescriptor> {
    if images.is_empty() {
        return Err(anyhow!("No cloud-init capable images found in the catalog."));
    }

    let items: Vec<String> = images
        .iter()
        .map(|img| format!("{} ({})", img.name, img.release_date))
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a Raspberry Pi OS image")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(images[selection].clone())
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[StorageDevice]) -> Result<StorageDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the target device to WRITE to")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Downloads, extracts, and verifies the selected image, with one progress
/// bar per stage.
fn acquire_image(
    cache: &DownloadCache,
    image: &ImageDescriptor,
    running: Arc<AtomicBool>,
) -> Result<PathBuf> {
    if cache.is_cached(image)? {
        println!(
            "{} Using cached image: {}",
            style("✓").green(),
            style(&image.name).cyan()
        );
        return Ok(cache.acquire(
            image,
            running,
            |_| {},
            |_| {},
            |_| {},
            |_| {},
            |_| {},
            |_| {},
        )?);
    }

    println!(
        "{} {} ({:.1} MB, released {})",
        style("Downloading").cyan().bold(),
        image.name,
        image.image_download_size as f64 / (1024.0 * 1024.0),
        image.release_date,
    );

    let download_pb = byte_progress_bar("Download", "cyan");
    let extract_pb = byte_progress_bar("Extract", "blue");
    let verify_pb = byte_progress_bar("Verify", "magenta");

    let path = cache.acquire(
        image,
        running,
        |total| download_pb.set_length(total),
        |done| download_pb.set_position(done),
        |total| {
            finish_stage(&download_pb, "Download complete.");
            extract_pb.set_length(total);
        },
        |done| extract_pb.set_position(done),
        |total| {
            // Extraction is skipped for uncompressed images, so the download
            // bar may still be open here.
            finish_stage(&download_pb, "Download complete.");
            finish_stage(&extract_pb, "Extraction complete.");
            verify_pb.set_length(total);
        },
        |done| verify_pb.set_position(done),
    )?;

    finish_stage(&verify_pb, "Verification successful.");
    Ok(path)
}

fn run_flash(verify: bool, clear_cache: bool, running: Arc<AtomicBool>) -> Result<()> {
    let cache = open_cache()?;
    if clear_cache {
        cache.clear()?;
        println!("{} Download cache cleared.", style("✓").green());
    }

    let images = catalog::fetch_image_list(catalog::API_URL)?;
    let image = select_image(&images)?;
    let image_path = acquire_image(&cache, &image, running.clone())?;

    let handler = platform::native_handler()?;
    let devices = platform::eligible_devices(handler.as_ref())?;
    let device = select_device(&devices)?;

    let write_pb = byte_progress_bar("Writing", "green");
    let verify_pb = byte_progress_bar("Verifying", "magenta");

    let outcome = flash::flash(
        &image_path,
        &device,
        handler.as_ref(),
        verify,
        running,
        |dev, image_name| {
            println!(
                "{} This will erase all data on:",
                style("WARNING:").red().bold()
            );
            println!("  Device: {}", style(dev.node.display()).cyan());
            println!("  Name:   {}", dev.name);
            println!("  Size:   {}", dev.size);
            println!("  Image:  {}", style(image_name).cyan());
            println!();

            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Are you sure you want to continue?")
                .default(false)
                .interact()
                .unwrap_or(false)
        },
        |total| write_pb.set_length(total),
        |done| write_pb.set_position(done),
        |total| {
            finish_stage(&write_pb, "Write complete.");
            verify_pb.set_length(total);
        },
        |done| verify_pb.set_position(done),
    );

    match outcome {
        Ok(FlashOutcome::Declined) => {
            println!("Flash operation cancelled.");
            return Ok(());
        }
        Ok(FlashOutcome::Completed) => {
            if verify {
                verify_pb.finish_with_message("Verification successful.");
            } else {
                write_pb.finish_with_message("Write complete (verification skipped).");
            }
        }
        Err(e) => {
            write_pb.finish_and_clear();
            verify_pb.finish_and_clear();
            return Err(e.into());
        }
    }

    DeviceGuard::new(handler.as_ref()).authorize(&device.node)?;
    handler.eject(&device.node)?;

    println!(
        "\n✨ Successfully flashed {} with {}.",
        style(device.node.display()).cyan(),
        style(&image.name).cyan()
    );
    Ok(())
}

fn run_list() -> Result<()> {
    let handler = platform::native_handler()?;
    let devices = platform::eligible_devices(handler.as_ref())?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<15} {:<25} {:<10} {}", "DEVICE", "NAME", "SIZE", "BUS");
    println!("  {:-<15} {:-<25} {:-<10} {:-<5}", "", "", "", "");
    for device in devices {
        println!(
            "  {:<15} {:<25} {:<10} {}",
            device.node.display(),
            device.name,
            device.size,
            device.protocol
        );
    }
    Ok(())
}

fn run_images() -> Result<()> {
    let images = catalog::fetch_image_list(catalog::API_URL)?;
    if images.is_empty() {
        println!("No cloud-init capable images found in the catalog.");
        return Ok(());
    }

    println!("Found {} images:", images.len());
    println!("\n  {:<45} {:<12} {}", "NAME", "RELEASE", "DOWNLOAD");
    println!("  {:-<45} {:-<12} {:-<10}", "", "", "");
    for image in images {
        println!(
            "  {:<45} {:<12} {:>7.1} MB",
            image.name,
            image.release_date,
            image.image_download_size as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Flash {
            verify,
            clear_cache,
        } => run_flash(verify, clear_cache, running),
        Commands::List => run_list(),
        Commands::Images => run_images(),
        Commands::ClearCache => {
            let cache = open_cache()?;
            cache.clear()?;
            println!("{} Download cache cleared.", style("✓").green());
            Ok(())
        }
    }
}
