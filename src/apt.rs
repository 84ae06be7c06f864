//! Debian package operations through apt-get and dpkg.
//!
//! libapt-pkg has no maintained Rust binding, so package work shells out
//! through the command runner, which keeps the transparency guarantees:
//! every invocation is logged, long operations are relayed line by line,
//! and failures carry the captured stderr.
//!
//! All apt and dpkg subprocesses run with `DEBIAN_FRONTEND=noninteractive`;
//! an unattended run has no terminal to answer debconf prompts on.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::runner::{run_command, run_command_streaming};

/// Environment injected into every apt/dpkg subprocess.
const APT_ENV: [(&str, &str); 1] = [("DEBIAN_FRONTEND", "noninteractive")];

/// dpkg-query format: one `<package> <status> <version>` line per entry.
const QUERY_FORMAT: &str = "${Package} ${db:Status-Status} ${Version}\n";

/// Refresh the package index: `apt-get clean` then `apt-get update`.
pub fn update_index() -> Result<()> {
    tracing::info!("Refreshing package index");

    run_command_streaming("apt-get", &["clean"], &APT_ENV)?.ensure_success("apt-get clean")?;
    run_command_streaming("apt-get", &["update"], &APT_ENV)?.ensure_success("apt-get update")?;

    tracing::info!("Package index refreshed");
    Ok(())
}

/// Install packages from the configured repositories.
pub fn install(packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        tracing::warn!("install called with empty package list");
        return Ok(());
    }

    tracing::info!("Starting package installation: {:?}", packages);

    let mut args: Vec<&str> = vec!["install", "-y"];
    args.extend(packages.iter().map(String::as_str));

    let output = run_command_streaming("apt-get", &args, &APT_ENV)?;
    output.ensure_success("Package installation")?;

    tracing::info!("Package installation complete: {:?}", packages);
    Ok(())
}

/// Install a downloaded `.deb` archive via `dpkg -i`.
pub fn install_deb(path: &Path) -> Result<()> {
    let path_str = path.to_str().context("Archive path contains invalid UTF-8")?;

    tracing::info!("Installing archive: {}", path_str);

    let output = run_command_streaming("dpkg", &["-i", path_str], &APT_ENV)?;
    output.ensure_success("dpkg -i")?;

    tracing::info!("Archive installed: {}", path_str);
    Ok(())
}

/// Query installed versions for a set of packages in one dpkg-query call.
///
/// The returned map is keyed by the requested names and only contains
/// entries whose dpkg status is `installed`. Unknown packages are simply
/// absent; dpkg-query's non-zero exit for them is not an error here.
pub fn installed_versions(packages: &[String]) -> Result<HashMap<String, String>> {
    if packages.is_empty() {
        return Ok(HashMap::new());
    }

    let mut args: Vec<&str> = vec!["-W", "-f", QUERY_FORMAT];
    args.extend(packages.iter().map(String::as_str));

    // Missing packages make dpkg-query exit non-zero while still printing
    // the known ones, so only the spawn itself can fail the probe
    let output = run_command("dpkg-query", &args, &[])?;
    let installed = parse_query_output(&output.stdout);

    let mut versions = HashMap::new();
    for name in packages {
        // dpkg prints the unqualified name even for `pkg:arch` requests
        let base = name.split(':').next().unwrap_or(name);
        if let Some(version) = installed.get(name.as_str()).or_else(|| installed.get(base)) {
            versions.insert(name.clone(), version.clone());
        }
    }

    Ok(versions)
}

/// Parse `<package> <status> <version>` lines from dpkg-query.
///
/// Only entries in state `installed` are returned; `config-files`,
/// `half-installed` and friends do not satisfy a desired-state check.
fn parse_query_output(stdout: &str) -> HashMap<String, String> {
    let mut installed = HashMap::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            continue;
        }

        let (name, status, version) = (parts[0], parts[1], parts[2]);
        if status == "installed" && !version.is_empty() {
            installed.insert(name.to_string(), version.to_string());
        }
    }

    installed
}
