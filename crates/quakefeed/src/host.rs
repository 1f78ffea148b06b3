//! Process-level launcher and relaunch timer
//!
//! Relaunches are delegated to short-lived helper processes so they survive
//! the death of the process that scheduled them.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use quakefeed_connector_lib::{Launcher, RelaunchError, RelaunchTimer, StateStore};

/// How to re-invoke this binary with the same configuration flags
#[derive(Debug, Clone)]
pub struct SelfCommand {
    exe: PathBuf,
    base_args: Vec<OsString>,
}

impl SelfCommand {
    pub fn new(exe: impl Into<PathBuf>, base_args: Vec<OsString>) -> Self {
        Self {
            exe: exe.into(),
            base_args,
        }
    }

    pub fn current(base_args: Vec<OsString>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_args))
    }

    /// Full argument list for a subcommand
    pub fn args<I, S>(&self, subcommand: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args
            .iter()
            .cloned()
            .chain(subcommand.into_iter().map(Into::into))
            .collect()
    }

    /// Start a detached child running `subcommand`
    pub fn spawn<I, S>(&self, subcommand: I) -> Result<(), RelaunchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut command = Command::new(&self.exe);
        command
            .args(self.args(subcommand))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group so a signal to ours does not reach it
            command.process_group(0);
        }

        let child = command
            .spawn()
            .map_err(|e| RelaunchError::SpawnFailed(e.to_string()))?;
        debug!(pid = child.id(), exe = %self.exe.display(), "Spawned helper process");
        Ok(())
    }
}

/// Starts `quakefeed run`
pub struct ProcessLauncher {
    command: SelfCommand,
}

impl ProcessLauncher {
    pub fn new(command: SelfCommand) -> Self {
        Self { command }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<(), RelaunchError> {
        info!("Launching ingestion process");
        self.command.spawn(["run"])
    }
}

/// Schedules relaunches through `quakefeed relaunch` helpers. Each schedule
/// records a fresh token; a helper whose token is no longer pending does
/// nothing when it fires.
pub struct ProcessRelaunchTimer {
    command: SelfCommand,
    state: Arc<dyn StateStore>,
    allow_exact: bool,
    inexact_slack: Duration,
}

impl ProcessRelaunchTimer {
    pub fn new(
        command: SelfCommand,
        state: Arc<dyn StateStore>,
        allow_exact: bool,
        inexact_slack: Duration,
    ) -> Self {
        Self {
            command,
            state,
            allow_exact,
            inexact_slack,
        }
    }

    fn next_token() -> u64 {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        nanos ^ u64::from(std::process::id()).rotate_left(32)
    }

    fn schedule(&self, delay: Duration) -> Result<(), RelaunchError> {
        let token = Self::next_token();
        self.state.update(&mut |s| s.pending_relaunch = Some(token))?;

        let after_ms = delay.as_millis().to_string();
        let token_arg = token.to_string();
        self.command.spawn([
            "relaunch",
            "--after-ms",
            after_ms.as_str(),
            "--token",
            token_arg.as_str(),
        ])?;
        info!(token, delay_ms = delay.as_millis() as u64, "Relaunch helper scheduled");
        Ok(())
    }
}

impl RelaunchTimer for ProcessRelaunchTimer {
    fn schedule_exact(&self, delay: Duration) -> Result<(), RelaunchError> {
        if !self.allow_exact {
            return Err(RelaunchError::ExactDenied);
        }
        self.schedule(delay)
    }

    fn schedule_inexact(&self, delay: Duration) -> Result<(), RelaunchError> {
        self.schedule(delay + self.inexact_slack)
    }

    fn cancel_all(&self) -> Result<(), RelaunchError> {
        self.state.update(&mut |s| s.pending_relaunch = None)?;
        debug!("Pending relaunches cancelled");
        Ok(())
    }
}
