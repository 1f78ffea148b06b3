//! Restart machinery
//!
//! Two independent paths bring the ingestion process back after the host
//! kills it: a one-shot relaunch scheduled at teardown (fast path) and a
//! periodic keepalive (slow path). Both go through [`ensure_alive`] and
//! neither calls the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{RelaunchError, StateError};
use crate::state::StateStore;
use crate::traits::{Launcher, LivenessProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveCheck {
    IntentionallyStopped,
    AlreadyAlive,
    Launched,
}

/// Launch the ingestion process unless it was stopped on purpose or is
/// already running
pub fn ensure_alive(
    state: &dyn StateStore,
    probe: &dyn LivenessProbe,
    launcher: &dyn Launcher,
) -> Result<AliveCheck, RelaunchError> {
    if state.load()?.intentional_stop {
        debug!("Relaunch skipped: ingestion was stopped intentionally");
        return Ok(AliveCheck::IntentionallyStopped);
    }
    if probe.is_process_alive() {
        debug!("Relaunch skipped: ingestion already running");
        return Ok(AliveCheck::AlreadyAlive);
    }

    info!("Ingestion not running, launching");
    launcher.launch()?;
    Ok(AliveCheck::Launched)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchFire {
    /// The schedule was cancelled or superseded before it fired
    Cancelled,
    Checked(AliveCheck),
}

/// How often [`wait_for_exit`] re-checks the probe
const EXIT_POLL: Duration = Duration::from_millis(250);

/// Wait up to `limit` for the probed process to exit. Returns true once it
/// is gone, false if it is still alive at the deadline.
pub async fn wait_for_exit(probe: &dyn LivenessProbe, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !probe.is_process_alive() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(EXIT_POLL.min(remaining)).await;
    }
}

/// Body of a scheduled one-shot relaunch. Acts only if `token` is still the
/// pending relaunch, and clears it either way.
///
/// The process that scheduled the relaunch may still be shutting down when
/// this fires, so its exit is awaited for up to `exit_wait` before the
/// liveness check.
pub async fn fire_scheduled_relaunch(
    state: &dyn StateStore,
    probe: &dyn LivenessProbe,
    launcher: &dyn Launcher,
    token: u64,
    exit_wait: Duration,
) -> Result<RelaunchFire, RelaunchError> {
    let pending = state.load()?.pending_relaunch;
    if pending != Some(token) {
        debug!(token, ?pending, "Scheduled relaunch no longer pending");
        return Ok(RelaunchFire::Cancelled);
    }

    if !wait_for_exit(probe, exit_wait).await {
        warn!(
            token,
            wait_secs = exit_wait.as_secs(),
            "Previous ingestion process still alive after exit wait"
        );
    }

    let mut pending = None;
    state.update(&mut |s| {
        pending = s.pending_relaunch;
        if s.pending_relaunch == Some(token) {
            s.pending_relaunch = None;
        }
    })?;

    if pending != Some(token) {
        debug!(token, ?pending, "Scheduled relaunch cancelled while waiting for exit");
        return Ok(RelaunchFire::Cancelled);
    }
    ensure_alive(state, probe, launcher).map(RelaunchFire::Checked)
}

/// Periodic slow-path check
pub struct Keepalive {
    interval: Duration,
    state: Arc<dyn StateStore>,
    probe: Arc<dyn LivenessProbe>,
    launcher: Arc<dyn Launcher>,
}

impl Keepalive {
    pub fn new(
        interval: Duration,
        state: Arc<dyn StateStore>,
        probe: Arc<dyn LivenessProbe>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            interval,
            state,
            probe,
            launcher,
        }
    }

    pub fn check(&self) -> Result<AliveCheck, RelaunchError> {
        ensure_alive(self.state.as_ref(), self.probe.as_ref(), self.launcher.as_ref())
    }

    /// Check every interval until shutdown; errors are logged and retried on
    /// the next tick
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Keepalive started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.check() {
                        Ok(outcome) => debug!(?outcome, "Keepalive check"),
                        Err(e) => warn!(error = %e, "Keepalive check failed"),
                    }
                }
            }
        }
    }
}

/// Pid file written by a running ingestion process
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_current(&self) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(&self.path, std::process::id().to_string())?;
        Ok(())
    }

    pub fn read(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Liveness from the pid file and `/proc/<pid>`
pub struct PidFileProbe {
    pid_file: PidFile,
    proc_root: PathBuf,
}

impl PidFileProbe {
    pub fn new(pid_file: PidFile) -> Self {
        Self {
            pid_file,
            proc_root: PathBuf::from("/proc"),
        }
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }
}

impl LivenessProbe for PidFileProbe {
    fn is_process_alive(&self) -> bool {
        match self.pid_file.read() {
            Some(pid) => self.proc_root.join(pid.to_string()).exists(),
            None => false,
        }
    }
}
