//! Provisioning Stage Machine
//!
//! This module provides an authoritative, Rust-side source of truth for pipeline
//! progress. It enforces valid stage transitions and makes it impossible to skip
//! stages programmatically.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: The `ProvisionContext` owns the current stage
//! - **Validated Transitions**: Only forward transitions to the next stage are allowed
//! - **No Global State**: State is owned by `ProvisionContext`, not global/static
//! - **Fail Fast**: Invalid transitions return errors immediately
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! RefreshingPackageIndex
//!     ↓
//! InstallingSystemPackages
//!     ↓
//! InstallingConverter
//!     ↓
//! InstallingEnvManager
//!     ↓
//! PersistingPathExport
//!     ↓
//! CreatingEnvironment
//!     ↓
//! InitializingShellHooks
//!     ↓
//! Completed
//!
//! (Any stage can transition to Failed)
//! ```

// Library API - inspection methods are exported for external use but not consumed by the binary
#![allow(dead_code)]

use std::fmt;
use thiserror::Error;

/// Provisioning stages in sequential order.
///
/// Each stage covers one slice of the pipeline. Stages are ordered and can
/// only progress forward (except for failure transitions). Steps that share a
/// failure domain run under the same stage: the bootstrap download and its
/// batch-mode execution are both `InstallingEnvManager`, and the startup-file
/// merge plus the in-process PATH/TAR export are both `PersistingPathExport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProvisionStage {
    /// Pipeline has not started yet
    NotStarted = 0,

    /// Phase 1: Refreshing the apt package index
    RefreshingPackageIndex = 1,

    /// Phase 2: Installing the fixed set of OS packages
    InstallingSystemPackages = 2,

    /// Phase 3: Downloading and installing the pinned document converter .deb
    InstallingConverter = 3,

    /// Phase 4: Downloading the arch-matched bootstrap installer and running
    /// it in batch mode
    InstallingEnvManager = 4,

    /// Phase 5: Merging the PATH export into the shell startup file and
    /// exporting PATH/TAR for child processes
    PersistingPathExport = 5,

    /// Phase 6: Creating the named environment from the dependency spec file
    CreatingEnvironment = 6,

    /// Phase 7: Installing the manager's shell integration hooks
    InitializingShellHooks = 7,

    /// Provisioning completed successfully (terminal state)
    Completed = 8,

    /// Provisioning failed (terminal state)
    /// The owning context records the stage at which failure occurred
    Failed = 255,
}

impl ProvisionStage {
    /// Returns the numeric order of this stage (0-8, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state (Completed or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if this stage mutates the machine (package database,
    /// filesystem, or shell startup file)
    #[inline]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Completed | Self::Failed)
    }

    /// Returns the next stage in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::RefreshingPackageIndex),
            Self::RefreshingPackageIndex => Some(Self::InstallingSystemPackages),
            Self::InstallingSystemPackages => Some(Self::InstallingConverter),
            Self::InstallingConverter => Some(Self::InstallingEnvManager),
            Self::InstallingEnvManager => Some(Self::PersistingPathExport),
            Self::PersistingPathExport => Some(Self::CreatingEnvironment),
            Self::CreatingEnvironment => Some(Self::InitializingShellHooks),
            Self::InitializingShellHooks => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::RefreshingPackageIndex => "Refreshing package index",
            Self::InstallingSystemPackages => "Installing system packages",
            Self::InstallingConverter => "Installing document converter",
            Self::InstallingEnvManager => "Installing environment manager",
            Self::PersistingPathExport => "Persisting PATH export",
            Self::CreatingEnvironment => "Creating environment",
            Self::InitializingShellHooks => "Initializing shell hooks",
            Self::Completed => "Provisioning complete",
            Self::Failed => "Provisioning failed",
        }
    }

    /// Returns the approximate progress percentage for this stage
    pub const fn progress_percent(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::RefreshingPackageIndex => 5,
            Self::InstallingSystemPackages => 25,
            Self::InstallingConverter => 40,
            Self::InstallingEnvManager => 65,
            Self::PersistingPathExport => 70,
            Self::CreatingEnvironment => 90,
            Self::InitializingShellHooks => 95,
            Self::Completed => 100,
            Self::Failed => 0, // Progress is meaningless for failed state
        }
    }

    /// Returns all stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::RefreshingPackageIndex,
            Self::InstallingSystemPackages,
            Self::InstallingConverter,
            Self::InstallingEnvManager,
            Self::PersistingPathExport,
            Self::CreatingEnvironment,
            Self::InitializingShellHooks,
            Self::Completed,
        ]
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    /// Attempted to skip one or more stages
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    /// Attempted to go backwards (not allowed)
    #[error("Cannot go backwards from {from} to {to} (provisioning is forward-only)")]
    BackwardTransition {
        from: ProvisionStage,
        to: ProvisionStage,
    },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ProvisionStage },

    /// Attempted to transition to the same state
    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ProvisionStage },
}

/// Context for tracking pipeline state.
///
/// This struct owns the current provisioning stage and provides validated
/// transition methods. It ensures that stages cannot be skipped and that
/// transitions only move forward (except for failure).
///
/// # Example
///
/// ```
/// use gradestack::stage::{ProvisionContext, ProvisionStage};
///
/// let mut ctx = ProvisionContext::new();
/// assert_eq!(ctx.current_stage(), ProvisionStage::NotStarted);
///
/// // Advance to next stage
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_stage(), ProvisionStage::RefreshingPackageIndex);
///
/// // Cannot skip stages
/// assert!(ctx.transition_to(ProvisionStage::CreatingEnvironment).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    /// Current provisioning stage
    current: ProvisionStage,

    /// Stage at which failure occurred (if any)
    failed_at: Option<ProvisionStage>,

    /// History of entered stages with timestamps (stage, unix timestamp)
    /// This allows debugging and progress reporting without global state
    stage_history: Vec<(ProvisionStage, u64)>,
}

impl Default for ProvisionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionContext {
    /// Create a new provisioning context in the NotStarted state.
    pub fn new() -> Self {
        Self {
            current: ProvisionStage::NotStarted,
            failed_at: None,
            stage_history: Vec::with_capacity(ProvisionStage::all_stages().len()),
        }
    }

    /// Returns the current provisioning stage
    #[inline]
    pub fn current_stage(&self) -> ProvisionStage {
        self.current
    }

    /// Returns the stage at which failure occurred, if any
    #[inline]
    pub fn failed_at(&self) -> Option<ProvisionStage> {
        self.failed_at
    }

    /// Returns true if the pipeline has completed successfully
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == ProvisionStage::Completed
    }

    /// Returns true if the pipeline has failed
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == ProvisionStage::Failed
    }

    /// Returns true if the pipeline is in progress (not terminal)
    #[inline]
    pub fn is_in_progress(&self) -> bool {
        !self.current.is_terminal() && self.current != ProvisionStage::NotStarted
    }

    /// Returns the current progress percentage (0-100)
    #[inline]
    pub fn progress_percent(&self) -> u8 {
        self.current.progress_percent()
    }

    /// Returns the stage history as a slice of (stage, timestamp) pairs
    pub fn stage_history(&self) -> &[(ProvisionStage, u64)] {
        &self.stage_history
    }

    /// Advance to the next stage in sequence.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Completed or Failed
    pub fn advance(&mut self) -> Result<ProvisionStage, StageTransitionError> {
        // Cannot advance from terminal state
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }

        // SAFETY: next() only returns None for terminal states, which we checked above
        let next_stage = self.current.next().expect(
            "INTERNAL ERROR: non-terminal stage returned None from next() - this is a bug",
        );

        self.record_stage_transition(next_stage);
        self.current = next_stage;

        Ok(next_stage)
    }

    /// Transition to a specific stage (must be the next stage in sequence).
    ///
    /// This is stricter than `advance()` - it validates that you're transitioning
    /// to the expected stage, preventing logic errors.
    ///
    /// # Errors
    ///
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if target is not the immediate next stage
    /// - `FromTerminalState` if current is a terminal state
    pub fn transition_to(
        &mut self,
        target: ProvisionStage,
    ) -> Result<ProvisionStage, StageTransitionError> {
        // Cannot transition from terminal state
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }

        // Cannot transition to same state
        if target == self.current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }

        // Cannot transition to Failed via this method (use fail() instead)
        if target == ProvisionStage::Failed {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        // Check for backward transition
        if target.order() < self.current.order() {
            return Err(StageTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        // Check for skipped stages
        let next_stage = self.current.next();
        if next_stage != Some(target) {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        // Valid transition
        self.record_stage_transition(target);
        self.current = target;

        Ok(target)
    }

    /// Mark the pipeline as failed.
    ///
    /// This can be called from any non-terminal state and records which stage
    /// the failure occurred at.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Completed or Failed
    pub fn fail(&mut self) -> Result<(), StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }

        self.failed_at = Some(self.current);
        self.record_stage_transition(ProvisionStage::Failed);
        self.current = ProvisionStage::Failed;

        Ok(())
    }

    /// Record a stage transition in the history
    fn record_stage_transition(&mut self, stage: ProvisionStage) {
        // Seconds since UNIX_EPOCH; good enough for progress reporting
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.stage_history.push((stage, timestamp));
    }

    /// Reset the context to NotStarted state.
    ///
    /// This clears all history and the recorded failure stage.
    pub fn reset(&mut self) {
        self.current = ProvisionStage::NotStarted;
        self.failed_at = None;
        self.stage_history.clear();
    }
}

// Convert StageTransitionError to the main ProvisionError type
impl From<StageTransitionError> for crate::error::ProvisionError {
    fn from(err: StageTransitionError) -> Self {
        crate::error::ProvisionError::StageTransition(err.to_string())
    }
}
