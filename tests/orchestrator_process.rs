//! Orchestrator against real helper processes (`sh` scripts).

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slate::config::{HelperConfig, OrchestratorConfig};
use slate::devices::{Device, DeviceRegistry};
use slate::launcher::ProcessLauncher;
use slate::orchestrator::{CompletionEvent, Orchestrator, OrchestratorError, TestParams, TestStatus};
use slate::settings::{Settings, SettingsStore};
use tokio::sync::broadcast;

async fn orchestrator(dir: &Path, script: &str) -> Orchestrator {
    let helper = dir.join("helper.sh");
    std::fs::write(&helper, script).unwrap();

    let devices = Arc::new(DeviceRegistry::new());
    devices.set_selected_device(Device::at("10.0.0.5")).await;
    let settings = Arc::new(SettingsStore::in_memory(Settings {
        save_directory: Some(dir.to_path_buf()),
        tests: Vec::new(),
    }));

    Orchestrator::new(
        Arc::new(ProcessLauncher),
        HelperConfig {
            program: "sh".into(),
            args: vec![helper.display().to_string()],
        },
        devices,
        settings,
        &OrchestratorConfig::default(),
    )
}

async fn next_event(events: &mut broadcast::Receiver<CompletionEvent>) -> CompletionEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no completion event")
        .unwrap()
}

#[tokio::test]
async fn test_helper_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    // Echo the save directory back as part of the log path.
    let orch = orchestrator(
        dir.path(),
        "echo 'Connecting...'\n\
         echo \"{\\\"status\\\":\\\"running\\\",\\\"test_id\\\":\\\"real-1\\\",\\\"log_file_path\\\":\\\"$6/real-1.csv\\\"}\"\n\
         sleep 0.2\n\
         exit 0\n",
    )
    .await;
    let mut events = orch.subscribe();

    let record = orch.start_test(TestParams::new("Ripple", 0.1)).await.unwrap();
    assert_eq!(record.test_id, "real-1");
    assert_eq!(record.status, TestStatus::Running);
    assert_eq!(
        record.log_file_path,
        Some(format!("{}/real-1.csv", dir.path().display()))
    );

    let event = next_event(&mut events).await;
    assert_eq!(event.test_id, "real-1");
    assert_eq!(event.status, TestStatus::Completed);
    assert!(orch.ongoing().await.is_empty());
    assert_eq!(orch.completed().await[0].test_id, "real-1");
}

#[tokio::test]
async fn test_stderr_rejects_start() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), "echo 'pyvisa: no route to host' >&2\nexec sleep 30\n").await;

    let err = orch
        .start_test(TestParams::new("Ripple", 1.0))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::EarlyFailure(text) => assert!(text.contains("no route to host")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(orch.ongoing().await.is_empty());
}

#[tokio::test]
async fn test_exit_without_running_line_rejects_start() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), "echo 'Connecting...'\nexit 3\n").await;

    let err = orch
        .start_test(TestParams::new("Ripple", 1.0))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::ExitedBeforeRunning { exit } => assert_eq!(exit.code, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_stop_terminates_helper_without_event() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        dir.path(),
        "echo '{\"status\":\"running\",\"test_id\":\"long-1\"}'\nexec sleep 30\n",
    )
    .await;
    let mut events = orch.subscribe();

    orch.start_test(TestParams::new("Soak", 60.0)).await.unwrap();
    let stopped = orch.stop_test("long-1").await.unwrap();

    assert_eq!(stopped.status, TestStatus::Stopped);
    assert!(orch.ongoing().await.is_empty());
    assert!(tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .is_err());
    assert_eq!(orch.get("long-1").await.unwrap().status, TestStatus::Stopped);
}

#[tokio::test]
async fn test_shutdown_kills_every_helper() {
    let dir = tempfile::tempdir().unwrap();
    // No id reported: each test keeps its local id.
    let orch = orchestrator(dir.path(), "echo '{\"status\":\"running\"}'\nexec sleep 30\n").await;

    for name in ["a", "b", "c"] {
        orch.start_test(TestParams::new(name, 5.0)).await.unwrap();
    }
    assert_eq!(orch.ongoing().await.len(), 3);

    let report = orch.shutdown().await;

    assert_eq!(report.terminated, 3);
    assert_eq!(report.failed, 0);
    assert!(orch.ongoing().await.is_empty());
}
