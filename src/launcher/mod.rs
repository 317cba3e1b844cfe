//! Process launcher: spawn the helper program and hand back its output
//! streams, an exit notification, and a way to signal it.
//!
//! The [`Launcher`] trait is the seam the orchestrator depends on; the real
//! implementation lives in [`process`], tests drive a scripted one.

pub mod process;

#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

pub use self::process::ProcessLauncher;

/// A child's stdout or stderr.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' was spawned without a {stream} pipe")]
    MissingPipe {
        program: String,
        stream: &'static str,
    },

    #[error("process has already exited")]
    AlreadyExited,

    #[error("failed to read helper output: {0}")]
    Read(#[source] std::io::Error),
}

/// How hard to ask a child to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM on unix; lets the helper flush its CSV and close the instrument.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// Exit notification. `code` is `None` when the child died from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code),
            None => write!(f, "a signal"),
        }
    }
}

/// Requests termination of one child. Delivery failures after the request
/// is accepted are logged by the launcher, not returned.
pub trait Terminator: Send + Sync {
    fn terminate(&self, signal: Signal) -> Result<(), LaunchError>;
}

/// Everything the caller gets back from a successful spawn.
pub struct LaunchedChild {
    pub pid: Option<u32>,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    /// Resolves once the child has been reaped. A dropped sender means the
    /// exit status was lost and should be read as [`ProcessExit::signalled`].
    pub exit: oneshot::Receiver<ProcessExit>,
    pub terminator: Box<dyn Terminator>,
}

/// Spawns helper processes. Single attempt, no retry.
pub trait Launcher: Send + Sync {
    fn launch(&self, program: &str, args: &[String]) -> Result<LaunchedChild, LaunchError>;
}

/// Output of a helper run that was awaited to the end.
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
}

/// Launch `program`, drain both streams, and wait for the exit status.
pub async fn run_to_completion(
    launcher: &dyn Launcher,
    program: &str,
    args: &[String],
) -> Result<CollectedOutput, LaunchError> {
    let LaunchedChild {
        pid,
        mut stdout,
        mut stderr,
        exit,
        terminator: _terminator,
    } = launcher.launch(program, args)?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let (out_read, err_read) = tokio::join!(
        stdout.read_to_end(&mut out),
        stderr.read_to_end(&mut err)
    );
    out_read.map_err(LaunchError::Read)?;
    err_read.map_err(LaunchError::Read)?;

    let exit = exit.await.unwrap_or_else(|_| ProcessExit::signalled());
    tracing::debug!(program, pid, %exit, stdout_bytes = out.len(), "helper run finished");

    Ok(CollectedOutput {
        exit,
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        assert_eq!(ProcessExit::with_code(3).to_string(), "code 3");
        assert_eq!(ProcessExit::signalled().to_string(), "a signal");
        assert!(ProcessExit::with_code(0).success());
        assert!(!ProcessExit::signalled().success());
    }

    #[tokio::test]
    async fn test_run_to_completion_collects_both_streams() {
        let (launcher, mut children) = scripted::ScriptedLauncher::new();

        let run = tokio::spawn(async move {
            run_to_completion(&launcher, "helper", &["--discover".to_string()]).await
        });

        let mut child = children.recv().await.unwrap();
        assert_eq!(child.args, vec!["--discover"]);
        child.say("[]").await;
        child.complain("warning: slow subnet").await;
        child.exit(Some(0));

        let output = run.await.unwrap().unwrap();
        assert!(output.exit.success());
        assert_eq!(output.stdout.trim(), "[]");
        assert_eq!(output.stderr.trim(), "warning: slow subnet");
    }
}
