//! Real child processes via `tokio::process`.
//!
//! Each spawn gets a small monitor task that owns the `Child`, waits for it
//! to exit, and applies termination requests arriving over a channel. Owning
//! the child in one place means `wait` and `kill` never contend for `&mut`.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{LaunchError, LaunchedChild, Launcher, ProcessExit, Signal, Terminator};

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

/// Launches helpers as OS processes with piped stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<LaunchedChild, LaunchError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let pid = child.id();
        let missing = |stream| LaunchError::MissingPipe {
            program: program.to_string(),
            stream,
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        info!(program, pid, "helper spawned");
        tokio::spawn(monitor(child, pid, signal_rx, exit_tx));

        Ok(LaunchedChild {
            pid,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit_rx,
            terminator: Box::new(ChannelTerminator { tx: signal_tx }),
        })
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Forwards termination requests to the monitor task.
struct ChannelTerminator {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Terminator for ChannelTerminator {
    fn terminate(&self, signal: Signal) -> Result<(), LaunchError> {
        // The monitor drops its receiver once the child has been reaped.
        self.tx.send(signal).map_err(|_| LaunchError::AlreadyExited)
    }
}

async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let mut listening = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,

            signal = signals.recv(), if listening => match signal {
                Some(signal) => deliver(&mut child, pid, signal),
                // Every terminator is gone; nobody can ask us to stop anymore.
                None => listening = false,
            },
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit { code: status.code() },
        Err(e) => {
            warn!(pid, error = %e, "failed to wait for helper");
            ProcessExit::signalled()
        }
    };

    // Close the signal channel before announcing the exit so a terminator
    // used after the exit is observed reports `AlreadyExited`.
    drop(signals);
    debug!(pid, exit_code = exit.code, "helper reaped");
    let _ = exit_tx.send(exit);
}

fn deliver(child: &mut Child, pid: Option<u32>, signal: Signal) {
    match signal {
        Signal::Terminate => terminate_gracefully(child, pid),
        Signal::Kill => {
            debug!(pid, "sending SIGKILL to helper");
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "failed to kill helper");
            }
        }
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child, pid: Option<u32>) {
    // `pid` is only `None` once tokio has reaped the child.
    let Some(raw) = pid.or_else(|| child.id()) else {
        return;
    };

    debug!(pid = raw, "sending SIGTERM to helper");
    let rc = unsafe { libc::kill(raw as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            pid = raw,
            error = %std::io::Error::last_os_error(),
            "failed to SIGTERM helper"
        );
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child, pid: Option<u32>) {
    debug!(pid, "no graceful termination on this platform, killing helper");
    if let Err(e) = child.start_kill() {
        warn!(pid, error = %e, "failed to kill helper");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
