//! Pipeline orchestration
//!
//! Drives a full provisioning run: machine probe, plan build, preflight
//! gate, then stage-by-stage execution of the pending steps. Owns the
//! stage machine and produces a `RunReport` naming every step's outcome.
//!
//! # Failure Policy
//!
//! Every pending step is fatal to the run. Execution stops at the failed
//! stage, the stage machine records it, and the remaining steps are
//! reported as not reached. Re-running after a failure is safe: completed
//! work probes as satisfied and is skipped.

use crate::apt;
use crate::conda;
use crate::engine::plan::{build_plan, PlannedStep, ProvisionPlan, ProvisionStep, StepDisposition};
use crate::fetch;
use crate::manifest::ProvisionManifest;
use crate::preflight;
use crate::probe::ProbeReport;
use crate::shellrc;
use crate::stage::{ProvisionContext, ProvisionStage};
use crate::types::StepKind;
use anyhow::{Context, Result};
use std::fmt;
use std::time::{Duration, Instant};

// ============================================================================
// Run Report
// ============================================================================

/// Outcome of one planned step after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step executed and succeeded
    Applied,
    /// The desired state was already in place; nothing executed
    AlreadySatisfied,
    /// An earlier stage failed before this step was reached
    NotReached,
    /// The step executed and failed
    Failed(String),
}

impl StepOutcome {
    /// One-character marker for report rendering.
    fn marker(&self) -> &'static str {
        match self {
            Self::Applied => "✓",
            Self::AlreadySatisfied => "·",
            Self::NotReached => "-",
            Self::Failed(_) => "✗",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::AlreadySatisfied => write!(f, "already satisfied"),
            Self::NotReached => write!(f, "not reached"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Result of a provisioning run: per-step outcomes plus the terminal stage.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Steps in execution order with their outcomes
    pub outcomes: Vec<(ProvisionStep, StepOutcome)>,
    /// Terminal stage of the run (Completed or Failed)
    pub final_stage: ProvisionStage,
    /// Stage at which the run failed, if it did
    pub failed_stage: Option<ProvisionStage>,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

impl RunReport {
    /// Returns true if every reached step succeeded.
    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none()
    }

    /// Number of steps that executed and succeeded.
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == StepOutcome::Applied)
            .count()
    }

    /// Number of steps skipped because the machine already matched.
    pub fn satisfied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == StepOutcome::AlreadySatisfied)
            .count()
    }

    /// Returns a multi-line report for display.
    pub fn summary(&self) -> String {
        let mut lines = vec![self.to_string()];
        for (step, outcome) in &self.outcomes {
            lines.push(format!("  {} {} - {}", outcome.marker(), step, outcome));
        }
        lines.join("\n")
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.succeeded() {
            write!(
                f,
                "Run completed in {:.1}s ({} applied, {} already satisfied)",
                self.elapsed.as_secs_f64(),
                self.applied_count(),
                self.satisfied_count()
            )
        } else {
            write!(
                f,
                "Run failed at stage '{}' after {:.1}s",
                self.failed_stage
                    .map(|stage| stage.description())
                    .unwrap_or("unknown"),
                self.elapsed.as_secs_f64()
            )
        }
    }
}

// ============================================================================
// Provisioner
// ============================================================================

/// Orchestrates provisioning runs against a manifest.
pub struct Provisioner {
    manifest: ProvisionManifest,
    /// Skip the preflight gate. For test rigs that run unprivileged.
    pub skip_preflight: bool,
}

impl Provisioner {
    /// Create a provisioner for a manifest.
    pub fn new(manifest: ProvisionManifest) -> Self {
        Self {
            manifest,
            skip_preflight: false,
        }
    }

    /// The manifest this provisioner converges towards.
    #[allow(dead_code)] // API: accessor for external consumers
    pub fn manifest(&self) -> &ProvisionManifest {
        &self.manifest
    }

    /// Validate the manifest, probe the machine, and build the plan.
    ///
    /// Mutates nothing and needs no privileges, so `plan` mode and dry runs
    /// call this directly without the preflight gate.
    pub fn probe_and_plan(&self) -> Result<(ProbeReport, ProvisionPlan)> {
        self.manifest
            .validate()
            .context("Manifest validation failed")?;

        let probe = ProbeReport::collect(&self.manifest).context("Machine probe failed")?;
        tracing::info!("Probe: {}", probe);

        let plan = build_plan(&self.manifest, &probe);
        tracing::debug!("{}", plan.summary());

        Ok((probe, plan))
    }

    /// Run the full pipeline.
    ///
    /// Probes and plans before the preflight gate: the plan decides whether
    /// the network check applies at all. A machine that already matches the
    /// manifest downloads nothing and must converge even when offline.
    pub fn run(&self) -> Result<RunReport> {
        let (_probe, plan) = self.probe_and_plan()?;
        if plan.is_fully_satisfied() {
            tracing::info!("Machine already matches the manifest, nothing to do");
        }

        if !self.skip_preflight {
            preflight::run_preflight_checks(&self.manifest, plan.pending_count() > 0);
        }

        let selected: Vec<&PlannedStep> = plan.steps.iter().collect();
        self.execute(selected)
    }

    /// Run a single pipeline slice.
    ///
    /// Slices that install packages get the index refresh prepended when it
    /// is pending: a stale index breaks installs on fresh containers. As in
    /// [`Self::run`], the network check applies only when the selected steps
    /// leave actual work to do.
    pub fn run_slice(&self, kinds: &[StepKind]) -> Result<RunReport> {
        let (_probe, plan) = self.probe_and_plan()?;
        let selected = slice_selection(&plan, kinds);

        if !self.skip_preflight {
            let has_pending = selected
                .iter()
                .any(|planned| planned.disposition.is_pending());
            preflight::run_preflight_checks(&self.manifest, has_pending);
        }

        self.execute(selected)
    }

    /// Render the planned steps of one slice, for dry runs.
    pub fn slice_summary(&self, kinds: &[StepKind]) -> Result<String> {
        let (_probe, plan) = self.probe_and_plan()?;
        let selected = slice_selection(&plan, kinds);

        let mut lines = vec![format!("Slice plan ({} steps):", selected.len())];
        for planned in selected {
            lines.push(format!("  {} [{}]", planned.step, planned.disposition));
        }
        Ok(lines.join("\n"))
    }

    /// Execute the selected planned steps in order, driving the stage machine.
    fn execute(&self, steps: Vec<&PlannedStep>) -> Result<RunReport> {
        let started = Instant::now();
        let mut ctx = ProvisionContext::new();
        let mut outcomes: Vec<(ProvisionStep, StepOutcome)> = Vec::with_capacity(steps.len());
        let mut failed = false;

        for planned in &steps {
            if failed {
                outcomes.push((planned.step.clone(), StepOutcome::NotReached));
                continue;
            }

            match &planned.disposition {
                StepDisposition::Satisfied { detail } => {
                    tracing::info!("Skipping {} - {}", planned.step, detail);
                    outcomes.push((planned.step.clone(), StepOutcome::AlreadySatisfied));
                }
                StepDisposition::Pending { reason } => {
                    let stage = planned.step.stage();
                    advance_to(&mut ctx, stage)?;
                    tracing::info!(
                        "[{:>3}%] {} ({})",
                        stage.progress_percent(),
                        planned.step,
                        reason
                    );

                    let result = self
                        .execute_step(&planned.step)
                        .with_context(|| format!("Stage '{}' failed", stage));
                    match result {
                        Ok(()) => outcomes.push((planned.step.clone(), StepOutcome::Applied)),
                        Err(err) => {
                            tracing::error!("{:#}", err);
                            ctx.fail()?;
                            outcomes
                                .push((planned.step.clone(), StepOutcome::Failed(format!("{:#}", err))));
                            failed = true;
                        }
                    }
                }
            }
        }

        if !failed {
            while !ctx.is_complete() {
                ctx.advance()?;
            }
        }

        Ok(RunReport {
            outcomes,
            final_stage: ctx.current_stage(),
            failed_stage: ctx.failed_at(),
            elapsed: started.elapsed(),
        })
    }

    /// Dispatch one step to its executor.
    fn execute_step(&self, step: &ProvisionStep) -> Result<()> {
        match step {
            ProvisionStep::RefreshPackageIndex => apt::update_index(),
            ProvisionStep::InstallPackages { packages } => apt::install(packages),
            ProvisionStep::InstallConverter { package } => {
                let archive = fetch::download_to(
                    &package.url,
                    &self.manifest.scratch_dir,
                    &package.file_name(),
                )?;
                apt::install_deb(&archive)
            }
            ProvisionStep::DownloadInstaller { url, file_name } => {
                let installer = fetch::download_to(url, &self.manifest.scratch_dir, file_name)?;
                fetch::mark_executable(&installer)
            }
            ProvisionStep::RunInstaller { installer, .. } => {
                conda::run_installer(installer, &self.manifest.env_manager)
            }
            ProvisionStep::MergePathExport { startup_file, line } => {
                let changed = shellrc::ensure_line(startup_file, line)?;
                if changed {
                    tracing::info!("Added PATH export to {}", startup_file.display());
                } else {
                    tracing::info!("PATH export already present in {}", startup_file.display());
                }
                Ok(())
            }
            ProvisionStep::CreateEnvironment { spec_file, .. } => {
                // Only existence is checked; the spec format belongs to the manager
                if !spec_file.exists() {
                    anyhow::bail!(
                        "Dependency-specification file {} not found",
                        spec_file.display()
                    );
                }
                conda::create_env(
                    &self.manifest.env_manager,
                    &self.manifest.environment,
                    &self.manifest.tar_binary,
                )
            }
            ProvisionStep::InitShellHooks { .. } => {
                conda::init_shells(&self.manifest.env_manager, &self.manifest.tar_binary)
            }
        }
    }
}

/// Planned steps belonging to one slice run, in pipeline order.
fn slice_selection<'a>(plan: &'a ProvisionPlan, kinds: &[StepKind]) -> Vec<&'a PlannedStep> {
    let mut selected: Vec<&PlannedStep> = Vec::new();
    if !kinds.contains(&StepKind::PackageIndex)
        && kinds.iter().any(|kind| kind.touches_package_db())
    {
        selected.extend(plan.steps_for_kind(StepKind::PackageIndex));
    }
    for kind in kinds {
        selected.extend(plan.steps_for_kind(*kind));
    }
    // The stage machine only walks forward
    selected.sort_by_key(|planned| planned.step.stage().order());
    selected
}

/// Walk the stage machine forward to the target stage.
fn advance_to(ctx: &mut ProvisionContext, target: ProvisionStage) -> Result<()> {
    while ctx.current_stage().order() < target.order() {
        ctx.advance()?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
