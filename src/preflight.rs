//! Preflight verification that runs before any mutating pipeline stage.
//!
//! Catches broken images early: a container without `dpkg` or without root
//! produces a clear framed diagnostic instead of a half-applied run that
//! dies at stage three. `plan` mode skips preflight entirely since it never
//! mutates anything, and the network check only applies when the plan still
//! has pending work: an already-provisioned machine must converge even when
//! it is offline.

use nix::unistd::geteuid;
use std::process;

use crate::manifest::ProvisionManifest;
use crate::probe;

/// Outcome of the environment verification, one field per check.
#[derive(Debug)]
pub struct PreflightReport {
    /// Required binaries that could not be resolved on PATH.
    pub missing_binaries: Vec<String>,
    /// Whether the effective UID is root.
    pub is_root: bool,
    /// Whether `/etc/debian_version` exists.
    pub debian_family: bool,
    /// Whether this run still needs to download anything.
    pub network_required: bool,
    /// Manifest artifact hosts that did not answer a TCP connect. Only
    /// populated when the network is required.
    pub unreachable_hosts: Vec<String>,
}

impl PreflightReport {
    /// True when every check passed and execution may proceed.
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty()
            && self.is_root
            && self.debian_family
            && (!self.network_required || self.unreachable_hosts.is_empty())
    }
}

/// Binaries the pipeline shells out to. Each entry names the Debian package
/// that provides it.
pub const REQUIRED_BINARIES: &[&str] = &[
    "apt-get",     // apt
    "dpkg",        // dpkg
    "dpkg-query",  // dpkg
    "bash",        // bash (bootstrap installer is a shell archive)
    "tar",         // tar (exported as TAR for the environment manager)
];

/// Resolve a binary against PATH without spawning anything.
pub fn binary_exists(binary: &str) -> bool {
    which::which(binary).is_ok()
}

/// Effective-UID root check. Package installation and writes under /root
/// both need it.
pub fn is_running_as_root() -> bool {
    geteuid().is_root()
}

/// Run every check and collect the outcome. Does not exit; callers decide.
///
/// Artifact hosts are probed only when `network_required` is set; a run
/// whose plan is fully satisfied downloads nothing and must not fail on a
/// dead network.
pub fn verify_environment(
    manifest: &ProvisionManifest,
    network_required: bool,
) -> PreflightReport {
    let missing_binaries: Vec<String> = REQUIRED_BINARIES
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| binary.to_string())
        .collect();

    let unreachable_hosts = if network_required {
        probe::unreachable_targets(&probe::probe_targets(manifest))
    } else {
        Vec::new()
    };

    PreflightReport {
        missing_binaries,
        is_root: is_running_as_root(),
        debian_family: probe::is_debian_family(),
        network_required,
        unreachable_hosts,
    }
}

/// Debian package that provides a required binary, for the install hint.
fn package_for_binary(binary: &str) -> &str {
    match binary {
        "apt-get" => "apt",
        "dpkg" | "dpkg-query" => "dpkg",
        "bash" => "bash",
        "tar" => "tar",
        other => other,
    }
}

/// Print a framed diagnostic naming every failed check and its remedy, then
/// exit with the preflight status code.
fn print_error_and_exit(report: &PreflightReport) -> ! {
    eprintln!();
    eprintln!("╔════════════════════════════════════════════════════════════════╗");
    eprintln!("║              Gradestack Preflight Check FAILED                 ║");
    eprintln!("╚════════════════════════════════════════════════════════════════╝");
    eprintln!();

    if !report.is_root {
        eprintln!("❌ ERROR: Not running as root");
        eprintln!("   Package installation and /root writes require root privileges.");
        eprintln!();
        eprintln!("   Run as: sudo gradestack apply");
        eprintln!("   (tests may set GRADESTACK_SKIP_ROOT_CHECK=1 to bypass this check)");
        eprintln!();
    }

    if !report.debian_family {
        eprintln!("❌ ERROR: Not a Debian-family system");
        eprintln!("   /etc/debian_version was not found. This tool drives apt and");
        eprintln!("   dpkg and cannot provision other distributions.");
        eprintln!();
    }

    if !report.missing_binaries.is_empty() {
        eprintln!("❌ ERROR: Required binaries missing from PATH:");
        eprintln!();
        let mut packages: Vec<&str> = Vec::new();
        for binary in &report.missing_binaries {
            let package = package_for_binary(binary);
            eprintln!("   • {} (package: {})", binary, package);
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        eprintln!();
        eprintln!("   Install with:");
        eprintln!("   apt-get install -y {}", packages.join(" "));
        eprintln!();
    }

    if !report.unreachable_hosts.is_empty() {
        eprintln!("❌ ERROR: Artifact host(s) unreachable:");
        for host in &report.unreachable_hosts {
            eprintln!("   • {}", host);
        }
        eprintln!();
        eprintln!("   Pending steps download from these hosts. Check connectivity");
        eprintln!("   and proxy settings, or point the manifest at a reachable");
        eprintln!("   mirror.");
        eprintln!();
    }

    eprintln!("Resolve the errors above and run again.");
    eprintln!();

    process::exit(2);
}

/// Whether `GRADESTACK_SKIP_ROOT_CHECK` asks to bypass the root check.
pub fn should_skip_root_check() -> bool {
    std::env::var("GRADESTACK_SKIP_ROOT_CHECK")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Gate before execution: honors `GRADESTACK_SKIP_ROOT_CHECK`, exits with
/// the preflight status code on failure. `network_required` says whether
/// the plan still has steps that download.
pub fn run_preflight_checks(manifest: &ProvisionManifest, network_required: bool) {
    tracing::debug!(
        "Running preflight checks (network_required={})...",
        network_required
    );

    let mut report = verify_environment(manifest, network_required);

    if should_skip_root_check() {
        tracing::warn!("Root check skipped (GRADESTACK_SKIP_ROOT_CHECK=1)");
        report.is_root = true; // Pretend we're root
    }

    if !report.is_ok() {
        print_error_and_exit(&report);
    }

    tracing::info!("Preflight checks passed");
}
