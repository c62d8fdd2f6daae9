//! Ownership of a single spawned worker process.
//!
//! A [`ProcessHandle`] is created from a [`LaunchSpec`], hands out its piped
//! output streams once, and can terminate the worker together with every
//! process it started.

pub mod census;
pub mod signal;

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::launch::LaunchSpec;
use census::{CancelTarget, ProcessTable};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal (Unix only).
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A running (or finished) worker process. Exactly one owner.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<WorkerExit>,
}

impl ProcessHandle {
    /// Start the worker described by `spec`.
    ///
    /// On Unix the worker leads its own process group so the whole family
    /// can be signalled at once.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.arguments)
            .current_dir(&spec.working_directory)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    executable: spec.executable.clone(),
                    source,
                }
            } else {
                SpawnError::Os {
                    executable: spec.executable.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id().ok_or_else(|| SpawnError::Os {
            executable: spec.executable.clone(),
            source: io::Error::other("process exited before its pid was read"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        debug!(pid, executable = %spec.executable.display(), "spawned worker");

        Ok(Self {
            pid,
            child,
            stdout,
            stderr,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the stdout pipe. Returns `None` on every call after the first.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the stderr pipe. Returns `None` on every call after the first.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// The recorded exit status, if the worker has been observed to exit.
    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Wait for the worker to exit. Cancel-safe.
    pub async fn wait(&mut self) -> io::Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = WorkerExit::from(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Poll for exit without blocking.
    pub fn try_exit(&mut self) -> io::Result<Option<WorkerExit>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let exit = self.child.try_wait()?.map(WorkerExit::from);
        self.exit = exit;
        Ok(exit)
    }

    /// Terminate the worker and all of its descendants.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        let table = census::system_table();
        self.terminate_with(table.as_ref(), grace).await
    }

    /// Terminate using an explicit process table for descendant discovery.
    ///
    /// SIGTERM goes to the worker's group and to every descendant found in
    /// the snapshot; whatever is still running after `grace` gets SIGKILL.
    /// Terminating a worker that already exited is a no-op.
    pub async fn terminate_with(
        &mut self,
        table: &dyn ProcessTable,
        grace: Duration,
    ) -> io::Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }

        let target = CancelTarget::discover(table, self.pid);
        debug!(
            pid = self.pid,
            descendants = target.descendant_pids.len(),
            "terminating worker process tree"
        );
        target.signal_terminate();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => {
                result?;
            }
            Err(_elapsed) => {
                warn!(pid = self.pid, ?grace, "worker ignored SIGTERM, sending SIGKILL");
                target.signal_kill();
                if let Err(e) = self.child.start_kill() {
                    debug!(pid = self.pid, error = %e, "start_kill failed");
                }
                self.wait().await?;
            }
        }

        let killed = target.kill_surviving_descendants();
        if killed > 0 {
            debug!(pid = self.pid, killed, "killed descendants that outlived the worker");
        }
        Ok(())
    }
}
