//! Environment manager operations.
//!
//! Drives the bootstrap installer and the installed `mamba`/`conda` binary:
//! batch installation, named-environment creation from a
//! dependency-specification file, and shell hook initialization. Binaries are
//! addressed by absolute path under the install prefix, so nothing here
//! depends on the startup-file PATH export having taken effect yet.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::manifest::{CondaEnvironment, EnvManagerSpec};
use crate::runner::{run_command, run_command_streaming};

/// Marker line the manager writes into the startup file once shell hooks
/// are initialized.
pub const INIT_MARKER: &str = "# >>> conda initialize >>>";

/// Locate the manager's activation binary under the install prefix.
///
/// Prefers `mamba`, falls back to `conda`. `None` doubles as the
/// desired-state probe for the manager itself.
pub fn activation_binary(spec: &EnvManagerSpec) -> Option<PathBuf> {
    let bin_dir = spec.bin_dir();
    for candidate in ["mamba", "conda"] {
        let path = bin_dir.join(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Run the downloaded bootstrap installer in batch mode.
///
/// `-b` accepts the license non-interactively; `-p` pins the install prefix
/// instead of trusting the installer's home-directory default.
pub fn run_installer(installer: &Path, spec: &EnvManagerSpec) -> Result<()> {
    let installer_str = installer
        .to_str()
        .context("Installer path contains invalid UTF-8")?;
    let prefix_str = spec
        .install_prefix
        .to_str()
        .context("Install prefix contains invalid UTF-8")?;

    tracing::info!("Running bootstrap installer in batch mode: {}", installer_str);

    let output = run_command_streaming("bash", &[installer_str, "-b", "-p", prefix_str], &[])?;
    output.ensure_success("Bootstrap installer")?;

    tracing::info!("Environment manager installed at {}", prefix_str);
    Ok(())
}

/// Check whether a named environment already exists.
///
/// Queries `env list --json` and matches the manifest name against the
/// listed environment paths. A missing manager or an unparseable listing
/// count as "does not exist" rather than an error.
pub fn env_exists(spec: &EnvManagerSpec, name: &str) -> Result<bool> {
    let Some(mamba) = activation_binary(spec) else {
        return Ok(false);
    };
    let mamba_str = mamba
        .to_str()
        .context("Activation binary path contains invalid UTF-8")?;

    let output = run_command(mamba_str, &["env", "list", "--json"], &[])?;
    if !output.success {
        tracing::warn!("Environment listing failed: {}", output.stderr.trim());
        return Ok(false);
    }

    Ok(env_listed(&output.stdout, &spec.install_prefix, name))
}

/// Create the named environment from its dependency-specification file.
///
/// The manifest name is passed via `-n` so it wins over whatever name the
/// specification file declares.
pub fn create_env(
    spec: &EnvManagerSpec,
    environment: &CondaEnvironment,
    tar_binary: &Path,
) -> Result<()> {
    let mamba = activation_binary(spec).ok_or_else(|| {
        anyhow::anyhow!("No environment manager found under {:?}", spec.bin_dir())
    })?;
    let mamba_str = mamba
        .to_str()
        .context("Activation binary path contains invalid UTF-8")?;
    let spec_file = environment
        .spec_file
        .to_str()
        .context("Dependency-specification path contains invalid UTF-8")?;

    tracing::info!(
        "Creating environment '{}' from {}",
        environment.name,
        spec_file
    );

    let env = subprocess_env(spec, tar_binary);
    let env_pairs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let output = run_command_streaming(
        mamba_str,
        &["env", "create", "-n", &environment.name, "-f", spec_file],
        &env_pairs,
    )?;
    output.ensure_success("Environment creation")?;

    tracing::info!("Environment '{}' created", environment.name);
    Ok(())
}

/// Initialize shell integration hooks for all supported shells.
pub fn init_shells(spec: &EnvManagerSpec, tar_binary: &Path) -> Result<()> {
    let mamba = activation_binary(spec).ok_or_else(|| {
        anyhow::anyhow!("No environment manager found under {:?}", spec.bin_dir())
    })?;
    let mamba_str = mamba
        .to_str()
        .context("Activation binary path contains invalid UTF-8")?;

    tracing::info!("Initializing shell integration hooks");

    let env = subprocess_env(spec, tar_binary);
    let env_pairs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let output = run_command_streaming(mamba_str, &["init", "--all"], &env_pairs)?;
    output.ensure_success("Shell hook initialization")?;

    Ok(())
}

/// Environment injected into manager subprocesses.
///
/// The fresh `bin` directory goes first on PATH so helper binaries resolve
/// to the new installation, and the manager's unpack step honors `$TAR`, so
/// point it at the system archiver.
pub fn subprocess_env(spec: &EnvManagerSpec, tar_binary: &Path) -> Vec<(String, String)> {
    let current_path = std::env::var("PATH").unwrap_or_default();
    let path_value = format!("{}:{}", spec.bin_dir().display(), current_path);

    vec![
        ("PATH".to_string(), path_value),
        ("TAR".to_string(), tar_binary.display().to_string()),
    ]
}

/// Match a manifest environment name against an `env list --json` payload.
///
/// `base` names the install prefix itself; every other name matches on the
/// final path component, wherever the environment root lives.
fn env_listed(json_text: &str, install_prefix: &Path, name: &str) -> bool {
    let json: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Failed to parse environment list JSON: {}", e);
            return false;
        }
    };

    let Some(envs) = json["envs"].as_array() else {
        return false;
    };

    for env in envs {
        let Some(path) = env.as_str() else {
            continue;
        };
        let path = Path::new(path);

        if name == "base" {
            if path == install_prefix {
                return true;
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            return true;
        }
    }

    false
}
