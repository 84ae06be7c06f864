//! Machine state observation.
//!
//! Collects the facts planning needs: CPU architecture, privilege, Debian
//! lineage, network reachability, installed package versions, environment
//! manager presence, and startup-file state. Probing is read-only; nothing
//! here mutates the machine.
//!
//! # Design
//!
//! - **Pure Rust detection**: architecture comes from `uname(2)`, network
//!   from `TcpStream::connect_timeout`; no shelling out for facts the
//!   standard library or kernel can answer directly
//! - **Graceful defaults**: a probe that cannot answer reports "absent"
//!   and logs a warning, except architecture, where guessing would pick a
//!   wrong installer asset

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::apt;
use crate::conda;
use crate::manifest::ProvisionManifest;
use crate::shellrc;
use crate::types::MachineArch;

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// TCP connections to the manifest's artifact hosts succeeded
    Online,
    /// DNS resolution or TCP connection failed
    Offline,
}

impl NetworkState {
    /// Returns true if network connectivity is available.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Everything the planner needs to know about the machine, observed once
/// per run.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// CPU architecture, resolved from the kernel's machine field.
    pub arch: MachineArch,
    /// Whether the effective user is root.
    pub running_as_root: bool,
    /// Whether this looks like a Debian-family system.
    pub debian_family: bool,
    /// Network connectivity toward the manifest's artifact hosts.
    pub network: NetworkState,
    /// Installed versions for every package the manifest manages.
    pub installed_versions: HashMap<String, String>,
    /// Whether the manager's activation binary exists under the prefix.
    pub env_manager_present: bool,
    /// Whether the named environment is already listed.
    pub environment_present: bool,
    /// Whether the startup file carries the PATH export line.
    pub path_line_present: bool,
    /// Whether the startup file carries the shell-hook marker block.
    pub shell_hooks_present: bool,
}

impl ProbeReport {
    /// Observe the machine against a manifest.
    ///
    /// Architecture resolution is the only fatal probe: without it no
    /// installer asset can be chosen.
    pub fn collect(manifest: &ProvisionManifest) -> Result<Self> {
        let arch = detect_machine_arch()?;
        let running_as_root = nix::unistd::geteuid().is_root();
        let debian_family = is_debian_family();
        let network = detect_network(&probe_targets(manifest));

        let names: Vec<String> = manifest
            .package_records()
            .iter()
            .map(|record| record.name.clone())
            .collect();
        let installed_versions = apt::installed_versions(&names).unwrap_or_else(|e| {
            tracing::warn!("Package version probe failed: {}", e);
            HashMap::new()
        });

        let env_manager_present = conda::activation_binary(&manifest.env_manager).is_some();

        let environment_present = if env_manager_present {
            conda::env_exists(&manifest.env_manager, &manifest.environment.name).unwrap_or_else(
                |e| {
                    tracing::warn!("Environment listing probe failed: {}", e);
                    false
                },
            )
        } else {
            false
        };

        let export_line = shellrc::path_export_line(&manifest.env_manager.bin_dir());
        let path_line_present = shellrc::contains_line(&manifest.startup_file, &export_line)
            .unwrap_or_else(|e| {
                tracing::warn!("Startup file probe failed: {}", e);
                false
            });
        let shell_hooks_present = shellrc::has_marker(&manifest.startup_file, conda::INIT_MARKER)
            .unwrap_or_else(|e| {
                tracing::warn!("Startup file probe failed: {}", e);
                false
            });

        let report = Self {
            arch,
            running_as_root,
            debian_family,
            network,
            installed_versions,
            env_manager_present,
            environment_present,
            path_line_present,
            shell_hooks_present,
        };

        tracing::info!("Machine probe: {}", report);
        Ok(report)
    }

    /// Installed version for one managed package, if any.
    pub fn installed_version(&self, name: &str) -> Option<&str> {
        self.installed_versions.get(name).map(String::as_str)
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arch: {}, Root: {}, Debian: {}, Network: {}, Packages installed: {}, Manager: {}, Environment: {}",
            self.arch,
            if self.running_as_root { "yes" } else { "no" },
            if self.debian_family { "yes" } else { "no" },
            self.network,
            self.installed_versions.len(),
            presence(self.env_manager_present),
            presence(self.environment_present),
        )
    }
}

fn presence(present: bool) -> &'static str {
    if present { "present" } else { "absent" }
}

// ============================================================================
// Detection Functions
// ============================================================================

/// Resolve the CPU architecture from the kernel's machine field.
///
/// Unknown architectures are an error: silently assuming x86-64 would pick
/// an installer asset the machine cannot run, and fail later with a much
/// less useful diagnostic.
pub fn detect_machine_arch() -> Result<MachineArch> {
    let uts = nix::sys::utsname::uname().context("Failed to query uname")?;
    let machine = uts.machine().to_string_lossy();
    let arch = MachineArch::from_uname(&machine)?;

    tracing::info!(
        "Machine architecture detected: {} (uname reports {})",
        arch,
        machine
    );
    Ok(arch)
}

/// A Debian-family system carries `/etc/debian_version`; Debian, Ubuntu,
/// and their derivatives all ship it.
pub fn is_debian_family() -> bool {
    Path::new("/etc/debian_version").exists()
}

/// `host:port` pairs for every distinct artifact source in the manifest.
///
/// The converter .deb and the bootstrap installer are the only things the
/// pipeline downloads directly, so reachability of their hosts is what
/// decides whether download steps can work. Hosts come from the manifest
/// rather than a hard-coded address so a mirrored or air-gapped setup is
/// probed where its artifacts actually live. With the default manifest this
/// collapses to a single `github.com:443` entry.
pub fn probe_targets(manifest: &ProvisionManifest) -> Vec<String> {
    let mut targets = Vec::new();
    for raw in [&manifest.converter.url, &manifest.env_manager.release_base] {
        let Ok(url) = reqwest::Url::parse(raw) else {
            // validate() rejects non-URL values; an unparsable one here
            // just cannot contribute a probe target
            continue;
        };
        let Some(host) = url.host_str() else { continue };
        let port = url.port_or_known_default().unwrap_or(443);
        let target = format!("{}:{}", host, port);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Targets from [`probe_targets`] that did not answer a TCP connect.
pub fn unreachable_targets(targets: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|target| !host_reachable(target))
        .cloned()
        .collect()
}

/// Detect network connectivity via TCP connections to the artifact hosts.
///
/// Online only when every distinct host answers; a download step would
/// fail against any one of them. An empty target list is trivially online.
pub fn detect_network(targets: &[String]) -> NetworkState {
    if unreachable_targets(targets).is_empty() {
        NetworkState::Online
    } else {
        NetworkState::Offline
    }
}

/// One `host:port` reachability check: resolve, then try each address with
/// a 5-second `TcpStream::connect_timeout`. A DNS failure counts as
/// unreachable, which matches what a download step would experience.
fn host_reachable(target: &str) -> bool {
    let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::warn!("DNS resolution failed for {}: {}", target, e);
            return false;
        }
    };

    let timeout = Duration::from_secs(5);
    for addr in &addrs {
        if TcpStream::connect_timeout(addr, timeout).is_ok() {
            tracing::debug!("Network connectivity confirmed (TCP to {})", target);
            return true;
        }
    }

    tracing::warn!("Network connectivity check failed for {}", target);
    false
}

// ============================================================================
// Tests
// ============================================================================
