//! Type-safe core types for gradestack
//!
//! This module replaces stringly-typed provisioning values with proper Rust
//! enums that provide compile-time validation and exhaustive matching.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Machine architectures a bootstrap installer asset exists for.
///
/// Exactly two assets are published upstream. Anything else is refused at
/// probe time instead of silently receiving the x86-64 binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum MachineArch {
    #[default]
    #[strum(serialize = "x86_64")]
    X86_64,
    #[strum(serialize = "aarch64")]
    Aarch64,
}

impl MachineArch {
    /// Resolve an architecture from a `uname -m` (or `-p`) machine string.
    ///
    /// `arm` is accepted as an ARM64 alias because container runtimes on
    /// Apple-silicon hosts report it. 32-bit ARM userlands (`armv7l` and
    /// friends) are refused: no matching asset exists.
    pub fn from_uname(machine: &str) -> Result<Self> {
        match machine.trim() {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" | "arm" => Ok(Self::Aarch64),
            other => Err(ProvisionError::UnsupportedArchitecture(other.to_string())),
        }
    }

    /// Suffix used in upstream installer asset names (e.g. `Miniforge3-Linux-x86_64.sh`).
    pub fn asset_suffix(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Check if this is an ARM architecture
    pub fn is_arm(&self) -> bool {
        matches!(self, Self::Aarch64)
    }
}

/// Where a managed package is installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum PackageSource {
    /// Distribution repository via the system package manager
    #[default]
    #[strum(serialize = "repo")]
    Repo,
    /// Direct download of a pinned `.deb` release asset
    #[strum(serialize = "deb")]
    DirectDeb,
}

/// Identifiers for the provisioning pipeline slices.
///
/// Used for plan rendering, run reports, and the `step` CLI subcommand.
/// Ordering here mirrors the mandated execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum StepKind {
    #[strum(serialize = "package-index")]
    PackageIndex,
    #[strum(serialize = "system-packages")]
    SystemPackages,
    #[strum(serialize = "converter")]
    Converter,
    #[strum(serialize = "env-manager")]
    EnvManager,
    #[strum(serialize = "path-export")]
    PathExport,
    #[strum(serialize = "environment")]
    Environment,
    #[strum(serialize = "shell-hooks")]
    ShellHooks,
}

#[allow(dead_code)] // Methods available for future use
impl StepKind {
    /// Human-readable description for plan output and logs
    pub fn description(&self) -> &'static str {
        match self {
            Self::PackageIndex => "Refresh the package index",
            Self::SystemPackages => "Install system packages",
            Self::Converter => "Install the pinned document converter",
            Self::EnvManager => "Install the environment manager",
            Self::PathExport => "Persist the PATH export line",
            Self::Environment => "Create the named environment",
            Self::ShellHooks => "Initialize shell integration hooks",
        }
    }

    /// Check if this slice mutates the system package database
    pub fn touches_package_db(&self) -> bool {
        matches!(
            self,
            Self::PackageIndex | Self::SystemPackages | Self::Converter
        )
    }
}
