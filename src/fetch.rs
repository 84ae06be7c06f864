//! Artifact downloads for provisioning steps.
//!
//! Downloads release assets (the pinned converter `.deb`, the environment
//! manager's bootstrap installer) into the scratch directory. A progress bar
//! is drawn when stderr is a terminal; unattended build logs get start and
//! finish lines instead.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const USER_AGENT: &str = concat!("gradestack/", env!("CARGO_PKG_VERSION"));

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        // Release assets run to hundreds of megabytes; a total request
        // timeout would abort slow but healthy transfers
        .timeout(None)
        .build()
        .context("Failed to build HTTP client")
}

/// Download `url` into `dest_dir` as `file_name`, returning the written path.
///
/// Follows redirects (release URLs bounce through a CDN), verifies the HTTP
/// status, and rejects transfers shorter than the advertised length.
pub fn download_to(url: &str, dest_dir: &Path, file_name: &str) -> Result<PathBuf> {
    tracing::info!("Downloading {}", url);

    let client = http_client()?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to start download: {}", url))?;

    if !response.status().is_success() {
        bail!("Download failed: HTTP {} for {}", response.status(), url);
    }

    let total_size = response.content_length().unwrap_or(0);

    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create download directory {:?}", dest_dir))?;
    let dest = dest_dir.join(file_name);
    let mut file = File::create(&dest)
        .with_context(|| format!("Failed to create download file {:?}", dest))?;

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );

    let mut downloaded: u64 = 0;
    let mut buf = [0u8; 65536];
    loop {
        let n = response
            .read(&mut buf)
            .context("Error reading download stream")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .context("Error writing to download file")?;
        downloaded += n as u64;
        pb.set_position(downloaded);
    }
    pb.finish_and_clear();

    if total_size > 0 && downloaded != total_size {
        bail!(
            "Download truncated: got {} of {} bytes for {}",
            downloaded,
            total_size,
            url
        );
    }

    tracing::info!(
        "Downloaded {} ({}) to {:?}",
        file_name,
        humanize_size(downloaded),
        dest
    );

    Ok(dest)
}

/// Make a downloaded installer executable (mode 0755).
pub fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)
        .with_context(|| format!("Failed to stat {:?}", path))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to set permissions on {:?}", path))?;

    Ok(())
}

/// Convert bytes to human-readable size string.
fn humanize_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
