//! Long-running test orchestration.
//!
//! A test is one helper process started with `--start-test`. The
//! orchestrator keeps two disjoint collections: *ongoing* (helper not yet
//! exited) and *completed* (finished, kept for reporting). A record starts
//! `pending` under a locally generated id, is re-keyed under the helper's id
//! when the first `running` status line arrives, and leaves *ongoing* on
//! exit, stop, or shutdown.
//!
//! Each spawn is watched by one supervising task. Table mutations happen
//! under a single mutex that is never held across helper I/O, so every
//! event is applied atomically with respect to the others.

pub mod lines;
pub mod record;
pub mod status;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{HelperConfig, OrchestratorConfig};
use crate::devices::DeviceRegistry;
use crate::helper::start_test_args;
use crate::launcher::{LaunchError, LaunchedChild, Launcher, OutputStream, ProcessExit, Signal, Terminator};
use crate::settings::SettingsStore;

use self::lines::{LineReader, MAX_STATUS_LINE};
pub use self::record::{CompletionEvent, TestParams, TestRecord, TestStatus};
pub use self::status::StatusLine;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("No save directory selected")]
    NoSaveDirectory,

    #[error("host is shutting down")]
    ShuttingDown,

    #[error("failed to serialize test parameters: {0}")]
    Params(#[from] serde_json::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("helper reported an error before the test started: {0}")]
    EarlyFailure(String),

    #[error("helper exited with {exit} before reporting a running test")]
    ExitedBeforeRunning { exit: ProcessExit },

    #[error("test was stopped before the helper reported it running")]
    Aborted,

    #[error("Test with ID {id} not found. Available tests: {}", .known.join(", "))]
    TestNotFound { id: String, known: Vec<String> },
}

/// Outcome of [`Orchestrator::shutdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub terminated: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

struct OngoingTest {
    /// Distinguishes helper processes that end up under the same key.
    spawn: u64,
    record: TestRecord,
    terminator: Box<dyn Terminator>,
}

struct Tables {
    ongoing: HashMap<String, OngoingTest>,
    /// Oldest first.
    completed: VecDeque<TestRecord>,
    max_completed: usize,
    shutting_down: bool,
}

impl Tables {
    fn knows(&self, id: &str) -> bool {
        self.ongoing.contains_key(id) || self.completed.iter().any(|r| r.test_id == id)
    }

    fn retire(&mut self, record: TestRecord) {
        debug_assert!(record.status.is_terminal(), "retiring a live test");
        self.completed.push_back(record);
        while self.completed.len() > self.max_completed {
            if let Some(evicted) = self.completed.pop_front() {
                debug!(test_id = %evicted.test_id, "evicting oldest completed test");
            }
        }
    }
}

type Reply = oneshot::Sender<Result<TestRecord, OrchestratorError>>;

/// Where a spawn stands with respect to the caller of `start_test`.
enum Confirmation {
    /// No `running` line yet; the caller is still waiting.
    Pending(Reply),
    /// Confirmed under this id.
    Running(String),
    /// Rejected before confirmation; remaining output is ignored.
    Abandoned,
}

impl Confirmation {
    fn take_reply(&mut self) -> Option<Reply> {
        match std::mem::replace(self, Confirmation::Abandoned) {
            Confirmation::Pending(reply) => Some(reply),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// The helper-side half of a spawn, moved into its supervising task.
struct Spawned {
    spawn: u64,
    placeholder: String,
    pid: Option<u32>,
    stdout: OutputStream,
    stderr: OutputStream,
    exit: oneshot::Receiver<ProcessExit>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Inner {
    launcher: Arc<dyn Launcher>,
    helper: HelperConfig,
    devices: Arc<DeviceRegistry>,
    settings: Arc<SettingsStore>,
    tables: Mutex<Tables>,
    events: broadcast::Sender<CompletionEvent>,
    closing: watch::Sender<bool>,
    spawn_seq: AtomicU64,
}

/// Starts, tracks, and stops helper-backed tests. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        helper: HelperConfig,
        devices: Arc<DeviceRegistry>,
        settings: Arc<SettingsStore>,
        config: &OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                launcher,
                helper,
                devices,
                settings,
                tables: Mutex::new(Tables {
                    ongoing: HashMap::new(),
                    completed: VecDeque::new(),
                    max_completed: config.max_completed,
                    shutting_down: false,
                }),
                events,
                closing,
                spawn_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Receive a [`CompletionEvent`] for every test that ends on its own.
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has begun.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closing = self.inner.closing.subscribe();
        async move {
            let _ = closing.wait_for(|closed| *closed).await;
        }
    }

    /// Start a test on the selected device.
    ///
    /// Resolves as soon as the helper prints its first `running` status
    /// line, not when the test finishes. Fails without side effects when no
    /// device or save directory is configured.
    pub async fn start_test(&self, params: TestParams) -> Result<TestRecord, OrchestratorError> {
        let Some(address) = self.inner.devices.selected_address().await else {
            warn!(test = %params.name, "start rejected: no device selected");
            return Err(OrchestratorError::NoDeviceSelected);
        };
        let Some(save_dir) = self.inner.settings.save_directory().await else {
            warn!(test = %params.name, "start rejected: no save directory selected");
            return Err(OrchestratorError::NoSaveDirectory);
        };

        let params_json = serde_json::to_string(&params)?;
        let args = start_test_args(&self.inner.helper, &address, &params_json, &save_dir);
        let placeholder = Uuid::new_v4().to_string();
        let spawn = self.inner.spawn_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            // Spawn under the lock so a concurrent shutdown either sees the
            // new entry or rejects us first.
            let mut tables = self.inner.tables.lock().await;
            if tables.shutting_down {
                return Err(OrchestratorError::ShuttingDown);
            }

            let start_time = Utc::now();
            let LaunchedChild {
                pid,
                stdout,
                stderr,
                exit,
                terminator,
            } = self.inner.launcher.launch(&self.inner.helper.program, &args)?;

            let record = TestRecord {
                test_id: placeholder.clone(),
                name: params.name.clone(),
                requested_duration_minutes: params.duration,
                start_time,
                end_time: None,
                status: TestStatus::Pending,
                log_file_path: None,
            };
            tables.ongoing.insert(
                placeholder.clone(),
                OngoingTest {
                    spawn,
                    record,
                    terminator,
                },
            );

            info!(
                test_id = %placeholder,
                test = %params.name,
                %address,
                save_dir = %save_dir.display(),
                pid,
                "test helper spawned"
            );

            let spawned = Spawned {
                spawn,
                placeholder,
                pid,
                stdout,
                stderr,
                exit,
            };
            tokio::spawn(self.clone().supervise(spawned, reply_tx));
        }

        reply_rx.await.unwrap_or(Err(OrchestratorError::Aborted))
    }

    /// Stop an ongoing test.
    ///
    /// The record leaves *ongoing* right away; the helper's later exit is
    /// ignored and produces no completion event.
    pub async fn stop_test(&self, test_id: &str) -> Result<TestRecord, OrchestratorError> {
        let mut tables = self.inner.tables.lock().await;

        let Some(entry) = tables.ongoing.remove(test_id) else {
            let mut known: Vec<String> = tables.ongoing.keys().cloned().collect();
            known.sort();
            warn!(%test_id, ?known, "stop requested for unknown test");
            return Err(OrchestratorError::TestNotFound {
                id: test_id.to_string(),
                known,
            });
        };

        if let Err(e) = entry.terminator.terminate(Signal::Terminate) {
            warn!(%test_id, error = %e, "failed to signal helper, dropping test anyway");
        }

        let mut record = entry.record;
        record.status = TestStatus::Stopped;
        record.end_time = Some(Utc::now());
        tables.retire(record.clone());

        info!(%test_id, "test stopped");
        Ok(record)
    }

    /// Kill every ongoing helper and refuse further starts.
    ///
    /// Best effort: a helper that cannot be signalled is logged and
    /// forgotten like the rest.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut tables = self.inner.tables.lock().await;
        tables.shutting_down = true;
        self.inner.closing.send_replace(true);

        let mut report = ShutdownReport::default();
        for (test_id, entry) in tables.ongoing.drain() {
            info!(%test_id, "terminating test");
            match entry.terminator.terminate(Signal::Kill) {
                Ok(()) => report.terminated += 1,
                Err(e) => {
                    warn!(%test_id, error = %e, "failed to terminate helper during shutdown");
                    report.failed += 1;
                }
            }
        }

        info!(
            terminated = report.terminated,
            failed = report.failed,
            "orchestrator shut down"
        );
        report
    }

    /// Ongoing tests, oldest first. Includes helpers that have not confirmed.
    pub async fn ongoing(&self) -> Vec<TestRecord> {
        let tables = self.inner.tables.lock().await;
        let mut records: Vec<TestRecord> =
            tables.ongoing.values().map(|t| t.record.clone()).collect();
        records.sort_by_key(|r| r.start_time);
        records
    }

    /// Finished tests, oldest first.
    pub async fn completed(&self) -> Vec<TestRecord> {
        let tables = self.inner.tables.lock().await;
        tables.completed.iter().cloned().collect()
    }

    pub async fn get(&self, test_id: &str) -> Option<TestRecord> {
        let tables = self.inner.tables.lock().await;
        tables
            .ongoing
            .get(test_id)
            .map(|t| t.record.clone())
            .or_else(|| tables.completed.iter().find(|r| r.test_id == test_id).cloned())
    }

    /// Forget a finished test. Returns whether it was there.
    pub async fn discard_completed(&self, test_id: &str) -> bool {
        let mut tables = self.inner.tables.lock().await;
        let before = tables.completed.len();
        tables.completed.retain(|r| r.test_id != test_id);
        let removed = tables.completed.len() != before;
        if removed {
            debug!(%test_id, "completed test discarded");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Supervision
    // -----------------------------------------------------------------------

    async fn supervise(self, spawned: Spawned, reply: Reply) {
        let Spawned {
            spawn,
            placeholder,
            pid,
            stdout,
            mut stderr,
            exit,
        } = spawned;

        let mut confirmation = Confirmation::Pending(reply);
        let mut stdout = LineReader::new(stdout, MAX_STATUS_LINE, placeholder.clone());
        let mut chunk = [0u8; 4096];
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            // stdout first: a running line and a later warning arriving
            // together must confirm the test, not reject it.
            tokio::select! {
                biased;

                read = stdout.next_line(), if stdout_open => {
                    self.on_stdout_read(&placeholder, read, &mut stdout_open, &mut confirmation).await;
                }

                read = stderr.read(&mut chunk), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&chunk[..n]).trim().to_string();
                        if matches!(confirmation, Confirmation::Pending(_)) && stdout_open {
                            self.drain_ready_stdout(&placeholder, &mut stdout, &mut stdout_open, &mut confirmation)
                                .await;
                        }
                        self.on_stderr(&placeholder, text, &mut confirmation).await;
                    }
                    Err(e) => {
                        warn!(test_id = %placeholder, error = %e, "helper stderr read failed");
                        stderr_open = false;
                    }
                },
            }
        }

        let exit = exit.await.unwrap_or_else(|_| ProcessExit::signalled());
        debug!(test_id = %placeholder, pid, %exit, "helper exited");
        self.on_exit(spawn, &placeholder, exit, confirmation).await;
    }

    async fn on_stdout_read(
        &self,
        placeholder: &str,
        read: std::io::Result<Option<String>>,
        stdout_open: &mut bool,
        confirmation: &mut Confirmation,
    ) {
        match read {
            Ok(Some(line)) => self.on_stdout_line(placeholder, line.trim(), confirmation).await,
            Ok(None) => *stdout_open = false,
            Err(e) => {
                warn!(test_id = %placeholder, error = %e, "helper stdout read failed");
                *stdout_open = false;
            }
        }
    }

    /// Handle stdout lines that can be read without waiting, so output the
    /// helper wrote before a stderr chunk is seen before that chunk.
    async fn drain_ready_stdout(
        &self,
        placeholder: &str,
        stdout: &mut LineReader,
        stdout_open: &mut bool,
        confirmation: &mut Confirmation,
    ) {
        while *stdout_open && matches!(confirmation, Confirmation::Pending(_)) {
            let Some(read) = stdout.next_line().now_or_never() else {
                break;
            };
            self.on_stdout_read(placeholder, read, stdout_open, confirmation).await;
        }
    }

    async fn on_stdout_line(&self, placeholder: &str, line: &str, confirmation: &mut Confirmation) {
        if line.is_empty() {
            return;
        }

        let (reported_id, log_file_path) = match StatusLine::parse(line) {
            Ok(StatusLine::Running {
                test_id,
                log_file_path,
            }) => (test_id, log_file_path),
            Ok(StatusLine::Unrecognized) => {
                debug!(test_id = %placeholder, %line, "helper status");
                return;
            }
            Err(e) => {
                debug!(test_id = %placeholder, %line, error = %e, "ignoring non-JSON helper output");
                return;
            }
        };

        let Some(reply) = confirmation.take_reply() else {
            debug!(test_id = %placeholder, "ignoring repeated running status");
            return;
        };

        match self.promote(placeholder, reported_id, log_file_path).await {
            Ok(record) => {
                info!(
                    test_id = %record.test_id,
                    log_file_path = record.log_file_path.as_deref().unwrap_or(""),
                    "test running"
                );
                *confirmation = Confirmation::Running(record.test_id.clone());
                if reply.send(Ok(record)).is_err() {
                    debug!(test_id = %placeholder, "start caller went away; test keeps running");
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Re-key the pending record under its authoritative id.
    async fn promote(
        &self,
        placeholder: &str,
        reported_id: Option<String>,
        log_file_path: Option<String>,
    ) -> Result<TestRecord, OrchestratorError> {
        let mut tables = self.inner.tables.lock().await;

        let Some(mut entry) = tables.ongoing.remove(placeholder) else {
            return Err(if tables.shutting_down {
                OrchestratorError::ShuttingDown
            } else {
                OrchestratorError::Aborted
            });
        };

        let test_id = match reported_id {
            Some(id) if id != placeholder && tables.knows(&id) => {
                warn!(
                    reported = %id,
                    test_id = %placeholder,
                    "helper reported an id that is already in use, keeping local id"
                );
                placeholder.to_string()
            }
            Some(id) => id,
            None => placeholder.to_string(),
        };

        entry.record.test_id = test_id.clone();
        entry.record.status = TestStatus::Running;
        entry.record.log_file_path = log_file_path;
        let snapshot = entry.record.clone();
        tables.ongoing.insert(test_id, entry);

        Ok(snapshot)
    }

    async fn on_stderr(&self, placeholder: &str, text: String, confirmation: &mut Confirmation) {
        if text.is_empty() {
            return;
        }

        let Some(reply) = confirmation.take_reply() else {
            match confirmation {
                Confirmation::Running(test_id) => {
                    warn!(%test_id, stderr = %text, "helper diagnostic");
                }
                _ => debug!(test_id = %placeholder, stderr = %text, "helper diagnostic after rejection"),
            }
            return;
        };

        warn!(test_id = %placeholder, stderr = %text, "helper failed before confirming the test");
        {
            let mut tables = self.inner.tables.lock().await;
            if let Some(entry) = tables.ongoing.remove(placeholder) {
                if let Err(e) = entry.terminator.terminate(Signal::Terminate) {
                    warn!(test_id = %placeholder, error = %e, "failed to signal rejected helper");
                }
            }
        }
        let _ = reply.send(Err(OrchestratorError::EarlyFailure(text)));
    }

    async fn on_exit(
        &self,
        spawn: u64,
        placeholder: &str,
        exit: ProcessExit,
        confirmation: Confirmation,
    ) {
        match confirmation {
            Confirmation::Pending(reply) => {
                let was_pending = self.inner.tables.lock().await.ongoing.remove(placeholder).is_some();
                let err = if was_pending {
                    warn!(test_id = %placeholder, %exit, "helper exited before reporting a running test");
                    OrchestratorError::ExitedBeforeRunning { exit }
                } else {
                    OrchestratorError::Aborted
                };
                let _ = reply.send(Err(err));
            }
            Confirmation::Running(test_id) => self.finish(spawn, &test_id, exit).await,
            Confirmation::Abandoned => {
                debug!(test_id = %placeholder, %exit, "rejected helper exited");
            }
        }
    }

    /// Natural completion: move the record to *completed* and announce it.
    async fn finish(&self, spawn: u64, test_id: &str, exit: ProcessExit) {
        let event = {
            let mut tables = self.inner.tables.lock().await;

            if !tables.ongoing.get(test_id).is_some_and(|t| t.spawn == spawn) {
                debug!(%test_id, %exit, "helper exited after stop or shutdown");
                return;
            }
            let Some(OngoingTest { mut record, .. }) = tables.ongoing.remove(test_id) else {
                return;
            };

            let end_time = Utc::now();
            record.end_time = Some(end_time);
            record.status = if exit.success() {
                TestStatus::Completed
            } else {
                TestStatus::Failed
            };

            let event = CompletionEvent {
                test_id: record.test_id.clone(),
                status: record.status,
                end_time,
            };
            tables.retire(record);
            event
        };

        info!(%test_id, status = %event.status, %exit, "test finished");
        // No subscribers is fine; the record is still in `completed`.
        let _ = self.inner.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
