//! Subprocess execution for provisioning commands.
//!
//! This module provides the ONLY sanctioned way to run external commands.
//! All subprocess execution MUST go through `run_command` or
//! `run_command_streaming` to ensure:
//!
//! - Process group isolation (orphan cleanup compliance)
//! - Proper PID registration for cleanup
//! - A captured transcript for error reporting
//!
//! # Architecture Rule
//!
//! These functions are the execution gatekeeper. Any attempt to use
//! `Command::new` directly in step code violates the architecture.

use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use tracing::info;

/// Execute a command and capture its output quietly.
///
/// Used for probes and short-lived queries (`dpkg-query`, `mamba env list`)
/// where the transcript only matters on failure.
///
/// # Orphan Cleanup Compliance
///
/// - Spawns the command in a new process group via `.in_new_process_group()`
/// - Registers the child PID with `ChildRegistry::global()`
/// - Ensures cleanup if the parent process exits
///
/// # Returns
///
/// `Ok(output)` whether or not the command exited zero; spawn or wait
/// failures are the only `Err` cases. Callers decide what a non-zero exit
/// means via `CommandOutput::ensure_success`.
pub fn run_command(
    program: &str,
    args: &[&str],
    env_vars: &[(&str, &str)],
) -> Result<CommandOutput> {
    // Log exact command and environment for transparency
    info!("run_command: {} args={:?} env={:?}", program, args, env_vars);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group(); // CRITICAL: enables orphan cleanup

    // Inject per-command environment variables
    for (key, value) in env_vars {
        cmd.env(key, value);
    }

    // Spawn and register with global registry
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", program))?;
    let pid = child.id();

    // Register PID for cleanup on parent exit
    {
        let registry = ChildRegistry::global();
        // Lock is held briefly, panic is acceptable if poisoned
        let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
        guard.register(pid);
    }

    // Wait for completion
    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed waiting for command: {}", program))?;

    // Unregister PID after completion
    {
        let registry = ChildRegistry::global();
        let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
        guard.unregister(pid);
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();

    if output.status.success() {
        info!("Command {} executed successfully", program);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            success: true,
        })
    } else {
        let code = exit_code.unwrap_or(-1);
        info!("Command {} failed with exit code {}", program, code);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            success: false,
        })
    }
}

/// Execute a command, relaying its output line by line as it runs.
///
/// Used for long operations (`apt-get install`, the bootstrap installer,
/// `mamba env create`) so an unattended build log shows progress instead of
/// going silent for minutes. The full transcript is still captured for the
/// returned [`CommandOutput`].
pub fn run_command_streaming(
    program: &str,
    args: &[&str],
    env_vars: &[(&str, &str)],
) -> Result<CommandOutput> {
    info!(
        "run_command_streaming: {} args={:?} env={:?}",
        program, args, env_vars
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in env_vars {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", program))?;
    let pid = child.id();

    {
        let registry = ChildRegistry::global();
        let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
        guard.register(pid);
    }

    // Drain both pipes on their own threads; a full pipe buffer would
    // otherwise stall the child
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let tag = program.to_string();
    let stdout_handle = std::thread::spawn(move || relay_lines(stdout_pipe, &tag, false));
    let tag = program.to_string();
    let stderr_handle = std::thread::spawn(move || relay_lines(stderr_pipe, &tag, true));

    let status = child
        .wait()
        .with_context(|| format!("Failed waiting for command: {}", program))?;

    {
        let registry = ChildRegistry::global();
        let mut guard = registry.lock().expect("ChildRegistry mutex poisoned");
        guard.unregister(pid);
    }

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let exit_code = status.code();

    if status.success() {
        info!("Command {} executed successfully", program);
    } else {
        info!(
            "Command {} failed with exit code {}",
            program,
            exit_code.unwrap_or(-1)
        );
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        success: status.success(),
    })
}

/// Relay every line from a child pipe into the log, collecting the transcript.
fn relay_lines<R: Read>(pipe: Option<R>, tag: &str, is_stderr: bool) -> String {
    let mut transcript = String::new();
    let Some(pipe) = pipe else {
        return transcript;
    };

    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if is_stderr {
            tracing::warn!("[{}] {}", tag, line);
        } else {
            tracing::info!("[{}] {}", tag, line);
        }
        transcript.push_str(&line);
        transcript.push('\n');
    }
    transcript
}

/// Output from a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}
