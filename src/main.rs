//! Gradestack - Main entry point
//!
//! Unattended provisioner that converges a Debian-family machine to a
//! provisioning manifest: system packages, a pinned document converter,
//! a conda-compatible environment manager, and the grading environment.

mod apt;
mod cli;
mod conda;
mod engine;
mod error;
mod fetch;
mod manifest;
mod preflight;
mod probe;
mod process_guard;
mod provisioner;
mod runner;
mod shellrc;
mod stage;
mod types;

use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands, StepName};
use crate::manifest::ProvisionManifest;
use crate::provisioner::Provisioner;
use crate::types::StepKind;

/// Initialize tracing with appropriate settings
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Main application entry point
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging first
    init_tracing();
    info!("Gradestack starting up");

    // Initialize signal handlers for graceful child process cleanup
    // This ensures apt/installer children are terminated if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
        // Continue anyway - cleanup will still work via Drop
    }
    debug!("Signal handlers initialized");

    // ProcessGuard ensures all registered children are killed when main returns
    let _process_guard = process_guard::ProcessGuard::new();
    debug!("ProcessGuard initialized for child process tracking");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match cli.command {
        Some(Commands::Validate { manifest }) => {
            run_validate(&manifest)?;
        }
        Some(Commands::Plan { manifest }) => {
            run_plan(manifest.as_deref())?;
        }
        Some(Commands::Step { name, manifest }) => {
            run_step(name, manifest.as_deref(), cli.dry_run)?;
        }
        Some(Commands::Apply {
            manifest,
            save_manifest,
            skip_preflight,
        }) => {
            run_apply(
                manifest.as_deref(),
                save_manifest.as_deref(),
                skip_preflight,
                cli.dry_run,
            )?;
        }
        None => {
            info!("No command specified, applying the built-in manifest");
            run_apply(None, None, false, cli.dry_run)?;
        }
    }

    Ok(())
}

/// Load a manifest file, or fall back to the built-in default.
fn load_manifest(path: Option<&Path>) -> Result<ProvisionManifest, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading manifest from {:?}", path);
            Ok(ProvisionManifest::load_from_file(path)?)
        }
        None => {
            debug!("No manifest given, using the built-in default");
            Ok(ProvisionManifest::default())
        }
    }
}

/// Run the full pipeline (apply mode)
fn run_apply(
    manifest_path: Option<&Path>,
    save_manifest: Option<&Path>,
    skip_preflight: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = load_manifest(manifest_path)?;

    if let Some(save_path) = save_manifest {
        manifest.save_to_file(save_path)?;
        println!("✓ Manifest written to {}", save_path.display());
        return Ok(());
    }

    let mut provisioner = Provisioner::new(manifest);
    provisioner.skip_preflight = skip_preflight;

    if dry_run {
        info!("Dry-run mode: nothing will be executed");
        let (_probe, plan) = provisioner.probe_and_plan()?;
        println!("{}", plan.summary());
        return Ok(());
    }

    let report = provisioner.run()?;
    println!("{}", report.summary());
    if !report.succeeded() {
        std::process::exit(1);
    }

    Ok(())
}

/// Probe the machine and print the plan (plan mode)
fn run_plan(manifest_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = load_manifest(manifest_path)?;
    let provisioner = Provisioner::new(manifest);

    let (_probe, plan) = provisioner.probe_and_plan()?;
    println!("{}", plan.summary());

    Ok(())
}

/// Validate a manifest file
fn run_validate(manifest_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating manifest file: {:?}", manifest_path);
    match ProvisionManifest::load_from_file(manifest_path) {
        Ok(manifest) => match manifest.validate() {
            Ok(_) => {
                info!("Manifest validation successful");
                println!("✓ Manifest file is valid: {}", manifest_path.display());
            }
            Err(e) => {
                error!("Manifest validation failed: {}", e);
                eprintln!("✗ Manifest validation failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Failed to load manifest file: {}", e);
            eprintln!("✗ Failed to load manifest file: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Run a single pipeline slice (step mode)
fn run_step(
    name: StepName,
    manifest_path: Option<&Path>,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = load_manifest(manifest_path)?;
    let kinds = step_kinds(name);
    let provisioner = Provisioner::new(manifest);

    if dry_run {
        info!("Dry-run mode: nothing will be executed");
        println!("{}", provisioner.slice_summary(&kinds)?);
        return Ok(());
    }

    let report = provisioner.run_slice(&kinds)?;
    println!("{}", report.summary());
    if !report.succeeded() {
        std::process::exit(1);
    }

    Ok(())
}

/// Pipeline step kinds belonging to one CLI slice name.
fn step_kinds(name: StepName) -> Vec<StepKind> {
    match name {
        StepName::Packages => vec![StepKind::SystemPackages],
        StepName::Converter => vec![StepKind::Converter],
        // The PATH export belongs with the manager install
        StepName::EnvManager => vec![StepKind::EnvManager, StepKind::PathExport],
        StepName::Environment => vec![StepKind::Environment],
        StepName::ShellHooks => vec![StepKind::ShellHooks],
    }
}
