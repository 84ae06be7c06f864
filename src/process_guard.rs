//! Child process lifecycle management.
//!
//! Every provisioning step is an external command: apt-get, dpkg, the
//! bootstrap installer, mamba. If the provisioner dies mid-run, an orphaned
//! apt-get keeps the dpkg lock held and every later run deadlocks against
//! it. This module makes that impossible:
//!
//! - the runner spawns each child as the leader of a fresh process group,
//!   with a parent-death signal installed ([`CommandProcessGroup`])
//! - the runner registers every spawned PID in a global [`ChildRegistry`]
//!   and unregisters it after wait
//! - on shutdown (guard drop, SIGINT/SIGTERM/SIGHUP) each registered group
//!   gets SIGTERM, a grace period, then SIGKILL

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on a normal shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shorter grace period when a termination signal is already pending.
const SIGNAL_GRACE: Duration = Duration::from_secs(3);

/// PIDs of the provisioning commands currently running.
///
/// The runner registers a PID right after spawn and unregisters it after
/// wait, so at any instant the registry names exactly the children a dying
/// provisioner must take down with it.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_done: bool,
}

impl ChildRegistry {
    /// The process-wide registry the runner and the shutdown paths share.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Track a freshly spawned command.
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::debug!("Registered provisioning command PID {}", pid);
    }

    /// Stop tracking a command that has been waited on.
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::debug!("Unregistered provisioning command PID {}", pid);
    }

    /// Number of commands currently tracked.
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group: SIGTERM, wait up to `grace`,
    /// then SIGKILL whatever is still running.
    ///
    /// Runs at most once per registry; the signal-handler path and the guard
    /// drop can both reach here and must not race each other's kills.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.cleanup_done {
            return;
        }
        self.cleanup_done = true;

        if self.pids.is_empty() {
            tracing::debug!("No provisioning commands to terminate");
            return;
        }

        let targets: Vec<u32> = self.pids.drain().collect();
        tracing::info!("Terminating {} provisioning command(s)", targets.len());

        signal_groups(&targets, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if targets.iter().all(|&pid| !is_process_alive(pid)) {
                tracing::info!("All provisioning commands exited within the grace period");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let stubborn: Vec<u32> = targets
            .into_iter()
            .filter(|&pid| is_process_alive(pid))
            .collect();
        for &pid in &stubborn {
            tracing::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
        }
        signal_groups(&stubborn, Signal::SIGKILL);
    }
}

/// Deliver a signal to each PID's process group, falling back to the PID
/// itself. The group form (negative PID) reaches the whole command tree:
/// dpkg under apt-get, the conda processes under the bootstrap installer.
fn signal_groups(pids: &[u32], sig: Signal) {
    for &pid in pids {
        if signal::kill(Pid::from_raw(-(pid as i32)), sig).is_ok() {
            tracing::debug!("Sent {} to process group {}", sig, pid);
            continue;
        }
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            // Usually ESRCH: the command exited between drain and kill
            tracing::debug!("Could not deliver {} to PID {}: {}", sig, pid, e);
        }
    }
}

/// A PID counts as alive while it exists and is not a zombie. Zombies have
/// already exited; waiting on one would spin out the whole grace period.
pub(crate) fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !matches!(proc_state(pid), Some('Z') | Some('X'))
}

/// Process state letter from `/proc/<pid>/stat`, `None` when unreadable.
///
/// The state field follows the parenthesized command name, which may itself
/// contain spaces or parentheses, so split from the right.
fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    stat.rsplit(')')
        .next()?
        .split_whitespace()
        .next()?
        .chars()
        .next()
}

/// RAII shutdown hook. Held by `main` so that every exit path, panics
/// included, tears down whatever the registry still tracks.
pub struct ProcessGuard;

impl ProcessGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        tracing::debug!("ProcessGuard dropped, terminating remaining commands");
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.terminate_all(SHUTDOWN_GRACE);
        }
    }
}

/// Install handlers for SIGINT, SIGTERM, and SIGHUP that terminate the
/// registered commands before exiting with the conventional 128+signal
/// status. Call once at startup.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(
                "Received signal {}, terminating provisioning commands",
                sig
            );
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(SIGNAL_GRACE);
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension for `std::process::Command`: fresh process group plus
/// parent-death signal. The runner applies this to every spawn.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // Become leader of a new group so one negative-PID kill
                // reaches the whole command tree
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // And die with the provisioner: an orphaned apt-get would
                // keep the dpkg lock held across runs
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
