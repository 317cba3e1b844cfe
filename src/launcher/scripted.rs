//! In-memory launcher for tests: every launch hands the test a
//! [`ScriptedChild`] that plays the helper's part over duplex pipes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use super::{LaunchError, LaunchedChild, Launcher, ProcessExit, Signal, Terminator};

const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) struct ScriptedLauncher {
    children: mpsc::UnboundedSender<ScriptedChild>,
    launched: AtomicUsize,
    refuse_spawn: bool,
    failing_terminator: Option<usize>,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedChild>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Self {
            children: tx,
            launched: AtomicUsize::new(0),
            refuse_spawn: false,
            failing_terminator: None,
        };
        (launcher, rx)
    }

    /// Every launch fails as if the program did not exist.
    pub(crate) fn refusing(mut self) -> Self {
        self.refuse_spawn = true;
        self
    }

    /// The terminator of the `index`-th launch (0-based) returns an error.
    pub(crate) fn with_failing_terminator(mut self, index: usize) -> Self {
        self.failing_terminator = Some(index);
        self
    }

    pub(crate) fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<LaunchedChild, LaunchError> {
        if self.refuse_spawn {
            return Err(LaunchError::Spawn {
                program: program.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted refusal"),
            });
        }

        let index = self.launched.fetch_add(1, Ordering::SeqCst);
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let signals = Arc::new(Mutex::new(Vec::new()));

        let child = ScriptedChild {
            program: program.to_string(),
            args: args.to_vec(),
            stdout: Some(stdout_w),
            stderr: Some(stderr_w),
            exit: Some(exit_tx),
            signals: signals.clone(),
        };
        // The test may have stopped listening; the child then just idles.
        let _ = self.children.send(child);

        Ok(LaunchedChild {
            pid: Some(10_000 + index as u32),
            stdout: Box::pin(stdout_r),
            stderr: Box::pin(stderr_r),
            exit: exit_rx,
            terminator: Box::new(ScriptedTerminator {
                signals,
                fail: self.failing_terminator == Some(index),
            }),
        })
    }
}

struct ScriptedTerminator {
    signals: Arc<Mutex<Vec<Signal>>>,
    fail: bool,
}

impl Terminator for ScriptedTerminator {
    fn terminate(&self, signal: Signal) -> Result<(), LaunchError> {
        self.signals.lock().unwrap().push(signal);
        if self.fail {
            return Err(LaunchError::AlreadyExited);
        }
        Ok(())
    }
}

/// The test's end of one launched helper.
pub(crate) struct ScriptedChild {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit: Option<oneshot::Sender<ProcessExit>>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl ScriptedChild {
    /// Write one line to stdout.
    pub(crate) async fn say(&mut self, line: &str) {
        if let Some(out) = self.stdout.as_mut() {
            out.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
            out.flush().await.unwrap();
        }
    }

    /// Write raw text to stderr.
    pub(crate) async fn complain(&mut self, text: &str) {
        if let Some(err) = self.stderr.as_mut() {
            err.write_all(text.as_bytes()).await.unwrap();
            err.flush().await.unwrap();
        }
    }

    /// Close both pipes, then report the exit.
    pub(crate) fn exit(&mut self, code: Option<i32>) {
        self.stdout.take();
        self.stderr.take();
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(ProcessExit { code });
        }
    }

    /// Signals the orchestrator asked for so far.
    pub(crate) fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}
