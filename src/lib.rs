//! Gradestack Library
//!
//! This library provides the core functionality for the Debian-family
//! autograding-image provisioner.

pub mod apt;
pub mod cli;
pub mod conda;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod preflight;
pub mod probe;
pub mod process_guard;
pub mod provisioner;
pub mod runner;
pub mod shellrc;
pub mod stage;
pub mod types;

// Re-export main types for convenience
pub use error::ProvisionError;
pub use manifest::{CondaEnvironment, DebPackage, EnvManagerSpec, PackageRecord, ProvisionManifest};
pub use preflight::PreflightReport;
pub use probe::{NetworkState, ProbeReport};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use runner::CommandOutput;
pub use stage::{ProvisionContext, ProvisionStage, StageTransitionError};
pub use types::{MachineArch, PackageSource, StepKind};

// Plan engine
pub use engine::plan::{build_plan, PlannedStep, ProvisionPlan, ProvisionStep, StepDisposition};

// Pipeline orchestration
pub use provisioner::{Provisioner, RunReport, StepOutcome};
