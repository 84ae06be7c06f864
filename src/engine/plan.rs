//! Provisioning Plan Engine
//!
//! Translates a `ProvisionManifest` + `ProbeReport` pair into an ordered
//! sequence of `ProvisionStep` operations, each carrying a disposition:
//! pending (the machine diverges from the desired state) or satisfied
//! (nothing to do). The executor runs pending steps only, so re-running
//! against an already-provisioned machine executes nothing.
//!
//! # Disposition Rules
//!
//! | Step                | Satisfied when |
//! |---------------------|----------------|
//! | RefreshPackageIndex | No package-installing step is pending |
//! | InstallPackages     | Every manifest package reports dpkg status `installed` |
//! | InstallConverter    | Installed version matches the pinned version |
//! | DownloadInstaller   | Manager activation binary present under the prefix |
//! | RunInstaller        | Manager activation binary present under the prefix |
//! | MergePathExport     | Startup file already carries the export line |
//! | CreateEnvironment   | Manager lists the named environment |
//! | InitShellHooks      | Startup file carries the manager's init marker |
//!
//! # Design
//!
//! - **Pure logic**: No I/O, no side effects — only generates the plan
//! - **Fixed shape**: Every plan has the same eight steps in pipeline order;
//!   only the dispositions vary with the probed machine
//! - **One asset**: The bootstrap download resolves to the single installer
//!   URL matching the probed architecture
//! - **Concrete paths**: Steps carry fully-resolved paths and URLs so the
//!   executor never re-derives them

use crate::manifest::{DebPackage, ProvisionManifest};
use crate::probe::ProbeReport;
use crate::shellrc;
use crate::stage::ProvisionStage;
use crate::types::{MachineArch, StepKind};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Provision Step Types
// ============================================================================

/// A single atomic provisioning operation in the plan.
///
/// Operations are ordered: the plan generator emits them in the mandated
/// pipeline sequence (index refresh before installs, installer download
/// before its execution, PATH merge before environment creation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Refresh the apt package index (`apt-get update`)
    RefreshPackageIndex,

    /// Install repository packages (`apt-get install -y`)
    /// Carries only the packages the probe found missing
    InstallPackages { packages: Vec<String> },

    /// Download the pinned converter .deb and install it (`dpkg -i`)
    InstallConverter { package: DebPackage },

    /// Download the arch-matched bootstrap installer into the scratch dir
    DownloadInstaller { url: String, file_name: String },

    /// Run the bootstrap installer in batch mode (`bash <installer> -b -p`)
    RunInstaller { installer: PathBuf, prefix: PathBuf },

    /// Merge the PATH export line into the shell startup file
    MergePathExport { startup_file: PathBuf, line: String },

    /// Create the named environment from the dependency-specification file
    CreateEnvironment { name: String, spec_file: PathBuf },

    /// Install the manager's shell integration hooks (`init --all`)
    InitShellHooks { product: String },
}

impl ProvisionStep {
    /// The pipeline slice this step belongs to.
    ///
    /// Download and execution of the bootstrap installer share a slice: they
    /// form one failure domain and one desired-state check.
    pub fn kind(&self) -> StepKind {
        match self {
            Self::RefreshPackageIndex => StepKind::PackageIndex,
            Self::InstallPackages { .. } => StepKind::SystemPackages,
            Self::InstallConverter { .. } => StepKind::Converter,
            Self::DownloadInstaller { .. } | Self::RunInstaller { .. } => StepKind::EnvManager,
            Self::MergePathExport { .. } => StepKind::PathExport,
            Self::CreateEnvironment { .. } => StepKind::Environment,
            Self::InitShellHooks { .. } => StepKind::ShellHooks,
        }
    }

    /// The stage the executor reports while running this step.
    pub fn stage(&self) -> ProvisionStage {
        match self.kind() {
            StepKind::PackageIndex => ProvisionStage::RefreshingPackageIndex,
            StepKind::SystemPackages => ProvisionStage::InstallingSystemPackages,
            StepKind::Converter => ProvisionStage::InstallingConverter,
            StepKind::EnvManager => ProvisionStage::InstallingEnvManager,
            StepKind::PathExport => ProvisionStage::PersistingPathExport,
            StepKind::Environment => ProvisionStage::CreatingEnvironment,
            StepKind::ShellHooks => ProvisionStage::InitializingShellHooks,
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshPackageIndex => write!(f, "RefreshPackageIndex"),
            Self::InstallPackages { packages } => {
                write!(f, "InstallPackages({} packages)", packages.len())
            }
            Self::InstallConverter { package } => {
                write!(f, "InstallConverter({} {})", package.name, package.version)
            }
            Self::DownloadInstaller { file_name, .. } => {
                write!(f, "DownloadInstaller({})", file_name)
            }
            Self::RunInstaller { installer, prefix } => {
                write!(
                    f,
                    "RunInstaller({} -> {})",
                    installer.display(),
                    prefix.display()
                )
            }
            Self::MergePathExport { startup_file, .. } => {
                write!(f, "MergePathExport({})", startup_file.display())
            }
            Self::CreateEnvironment { name, .. } => write!(f, "CreateEnvironment({})", name),
            Self::InitShellHooks { product } => write!(f, "InitShellHooks({})", product),
        }
    }
}

/// Whether a step needs to run, with the observation that decided it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDisposition {
    /// The machine diverges from the manifest; the step must execute
    Pending { reason: String },
    /// The machine already matches the manifest; the step is skipped
    Satisfied { detail: String },
}

impl StepDisposition {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        !self.is_pending()
    }
}

impl fmt::Display for StepDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending { reason } => write!(f, "pending: {}", reason),
            Self::Satisfied { detail } => write!(f, "satisfied: {}", detail),
        }
    }
}

/// One step of the plan together with its disposition.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub step: ProvisionStep,
    pub disposition: StepDisposition,
}

/// A complete provisioning plan: the fixed step sequence with dispositions.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    /// Ordered sequence of planned steps
    pub steps: Vec<PlannedStep>,
    /// The architecture the installer asset was resolved for
    pub arch: MachineArch,
    /// The environment the plan converges towards
    pub environment: String,
}

impl ProvisionPlan {
    /// Number of steps that must execute.
    pub fn pending_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|planned| planned.disposition.is_pending())
            .count()
    }

    /// Returns true if the machine already matches the manifest.
    pub fn is_fully_satisfied(&self) -> bool {
        self.pending_count() == 0
    }

    /// Planned steps belonging to one pipeline slice, in order.
    pub fn steps_for_kind(&self, kind: StepKind) -> Vec<&PlannedStep> {
        self.steps
            .iter()
            .filter(|planned| planned.step.kind() == kind)
            .collect()
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!(
                "Provision plan ({}, environment '{}')",
                self.arch, self.environment
            ),
            format!(
                "  Steps ({}, {} pending):",
                self.steps.len(),
                self.pending_count()
            ),
        ];
        for (i, planned) in self.steps.iter().enumerate() {
            lines.push(format!(
                "    {}. {} [{}]",
                i + 1,
                planned.step,
                planned.disposition
            ));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Plan Calculation
// ============================================================================

/// Build the provisioning plan from a manifest and a probe of the machine.
///
/// Every manifest entry is checked against the probe before its step is
/// marked pending; the index refresh is pending only while some package
/// installation is, since a refreshed index serves no other step.
///
/// # What This Explicitly Refuses To Do
///
/// - Validate the manifest: `ProvisionManifest::validate` owns that, and
///   callers run it before planning
/// - Probe anything: the plan is a pure function of its two inputs
/// - Execute anything: dispatching pending steps is the provisioner's job
pub fn build_plan(manifest: &ProvisionManifest, probe: &ProbeReport) -> ProvisionPlan {
    let mut steps = Vec::with_capacity(8);

    // System packages: act on the missing subset only
    let missing: Vec<String> = manifest
        .system_packages
        .iter()
        .filter(|name| probe.installed_version(name).is_none())
        .cloned()
        .collect();
    let packages_pending = !missing.is_empty();
    let packages_step = if packages_pending {
        PlannedStep {
            step: ProvisionStep::InstallPackages {
                packages: missing.clone(),
            },
            disposition: StepDisposition::Pending {
                reason: format!(
                    "{} of {} packages missing: {}",
                    missing.len(),
                    manifest.system_packages.len(),
                    missing.join(", ")
                ),
            },
        }
    } else {
        PlannedStep {
            step: ProvisionStep::InstallPackages {
                packages: manifest.system_packages.clone(),
            },
            disposition: StepDisposition::Satisfied {
                detail: format!("all {} packages installed", manifest.system_packages.len()),
            },
        }
    };

    // Converter: presence is not enough, the pinned version must match
    let converter = &manifest.converter;
    let converter_disposition = match probe.installed_version(&converter.name) {
        Some(installed) if converter.version_satisfied_by(installed) => {
            StepDisposition::Satisfied {
                detail: format!("{} {} already installed", converter.name, installed),
            }
        }
        Some(installed) => StepDisposition::Pending {
            reason: format!(
                "{} {} installed, manifest pins {}",
                converter.name, installed, converter.version
            ),
        },
        None => StepDisposition::Pending {
            reason: format!("{} not installed", converter.name),
        },
    };
    let converter_pending = converter_disposition.is_pending();

    // Index refresh serves the package installs; skip it when they are skipped
    steps.push(PlannedStep {
        step: ProvisionStep::RefreshPackageIndex,
        disposition: if packages_pending || converter_pending {
            StepDisposition::Pending {
                reason: "package installations pending".to_string(),
            }
        } else {
            StepDisposition::Satisfied {
                detail: "no package installations pending".to_string(),
            }
        },
    });
    steps.push(packages_step);
    steps.push(PlannedStep {
        step: ProvisionStep::InstallConverter {
            package: converter.clone(),
        },
        disposition: converter_disposition,
    });

    // Environment manager: download + batch run share one desired-state check.
    // Exactly one asset URL is resolved, matching the probed architecture.
    let manager = &manifest.env_manager;
    let asset = manager.installer_asset(probe.arch);
    let manager_disposition = || {
        if probe.env_manager_present {
            StepDisposition::Satisfied {
                detail: format!(
                    "{} already installed at {}",
                    manager.product,
                    manager.install_prefix.display()
                ),
            }
        } else {
            StepDisposition::Pending {
                reason: format!(
                    "no activation binary under {}",
                    manager.bin_dir().display()
                ),
            }
        }
    };
    steps.push(PlannedStep {
        step: ProvisionStep::DownloadInstaller {
            url: manager.installer_url(probe.arch),
            file_name: asset.clone(),
        },
        disposition: manager_disposition(),
    });
    steps.push(PlannedStep {
        step: ProvisionStep::RunInstaller {
            installer: manifest.scratch_dir.join(&asset),
            prefix: manager.install_prefix.clone(),
        },
        disposition: manager_disposition(),
    });

    // PATH export merge
    let line = shellrc::path_export_line(&manager.bin_dir());
    steps.push(PlannedStep {
        step: ProvisionStep::MergePathExport {
            startup_file: manifest.startup_file.clone(),
            line,
        },
        disposition: if probe.path_line_present {
            StepDisposition::Satisfied {
                detail: format!(
                    "export line already in {}",
                    manifest.startup_file.display()
                ),
            }
        } else {
            StepDisposition::Pending {
                reason: format!("export line missing from {}", manifest.startup_file.display()),
            }
        },
    });

    // Named environment
    steps.push(PlannedStep {
        step: ProvisionStep::CreateEnvironment {
            name: manifest.environment.name.clone(),
            spec_file: manifest.environment.spec_file.clone(),
        },
        disposition: if probe.environment_present {
            StepDisposition::Satisfied {
                detail: format!("environment '{}' already listed", manifest.environment.name),
            }
        } else {
            StepDisposition::Pending {
                reason: format!("environment '{}' not listed", manifest.environment.name),
            }
        },
    });

    // Shell integration hooks
    steps.push(PlannedStep {
        step: ProvisionStep::InitShellHooks {
            product: manager.product.clone(),
        },
        disposition: if probe.shell_hooks_present {
            StepDisposition::Satisfied {
                detail: format!(
                    "init marker already in {}",
                    manifest.startup_file.display()
                ),
            }
        } else {
            StepDisposition::Pending {
                reason: format!("no init marker in {}", manifest.startup_file.display()),
            }
        },
    });

    ProvisionPlan {
        steps,
        arch: probe.arch,
        environment: manifest.environment.name.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
