//! One-shot calls into the instrument helper: network discovery and single
//! SCPI commands. Also owns the helper's command-line layout so every
//! operation builds arguments the same way.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::HelperConfig;
use crate::devices::{Device, DeviceRegistry};
use crate::launcher::{run_to_completion, LaunchError, Launcher, ProcessExit};

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("helper exited with {exit}: {stderr}")]
    Failed { exit: ProcessExit, stderr: String },

    #[error("helper returned unparsable discovery output: {source}")]
    Discovery {
        output: String,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Argument layout
// ---------------------------------------------------------------------------

/// `[configured args] --ip <address> --start-test <params> --savedir <dir>`
pub fn start_test_args(
    helper: &HelperConfig,
    address: &str,
    params_json: &str,
    save_dir: &Path,
) -> Vec<String> {
    let mut args = helper.args.clone();
    args.extend([
        "--ip".to_string(),
        address.to_string(),
        "--start-test".to_string(),
        params_json.to_string(),
        "--savedir".to_string(),
        save_dir.to_string_lossy().into_owned(),
    ]);
    args
}

/// `[configured args] --discover <subnet>`
pub fn discover_args(helper: &HelperConfig, subnet: &str) -> Vec<String> {
    let mut args = helper.args.clone();
    args.extend(["--discover".to_string(), subnet.to_string()]);
    args
}

/// `[configured args] --ip <address> --command <command>`
pub fn command_args(helper: &HelperConfig, address: &str, command: &str) -> Vec<String> {
    let mut args = helper.args.clone();
    args.extend([
        "--ip".to_string(),
        address.to_string(),
        "--command".to_string(),
        command.to_string(),
    ]);
    args
}

// ---------------------------------------------------------------------------
// InstrumentHelper
// ---------------------------------------------------------------------------

/// Runs short-lived helper invocations to completion.
#[derive(Clone)]
pub struct InstrumentHelper {
    launcher: Arc<dyn Launcher>,
    config: HelperConfig,
    devices: Arc<DeviceRegistry>,
}

impl InstrumentHelper {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        config: HelperConfig,
        devices: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            launcher,
            config,
            devices,
        }
    }

    /// Scan `subnet` (e.g. `10.0.0`) for LXI instruments.
    pub async fn discover(&self, subnet: &str) -> Result<Vec<Device>, HelperError> {
        info!(%subnet, "discovering instruments");
        let stdout = self.run(discover_args(&self.config, subnet)).await?;
        let trimmed = stdout.trim();

        let devices: Vec<Device> =
            serde_json::from_str(trimmed).map_err(|source| HelperError::Discovery {
                output: trimmed.to_string(),
                source,
            })?;

        info!(%subnet, found = devices.len(), "discovery finished");
        Ok(devices)
    }

    /// Send one SCPI command to the selected device and return its reply.
    pub async fn send_command(&self, command: &str) -> Result<String, HelperError> {
        let address = self
            .devices
            .selected_address()
            .await
            .ok_or(HelperError::NoDeviceSelected)?;
        self.send_command_to(&address, command).await
    }

    /// Send one SCPI command to an explicit address.
    pub async fn send_command_to(&self, address: &str, command: &str) -> Result<String, HelperError> {
        info!(%address, %command, "sending command");
        let stdout = self.run(command_args(&self.config, address, command)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn run(&self, args: Vec<String>) -> Result<String, HelperError> {
        let output = run_to_completion(self.launcher.as_ref(), &self.config.program, &args).await?;
        if !output.exit.success() {
            let stderr = output.stderr.trim().to_string();
            warn!(exit = %output.exit, %stderr, "helper call failed");
            return Err(HelperError::Failed {
                exit: output.exit,
                stderr,
            });
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::scripted::ScriptedLauncher;

    fn config() -> HelperConfig {
        HelperConfig {
            program: "python3".into(),
            args: vec!["vxi11-api.py".into()],
        }
    }

    #[test]
    fn test_start_test_layout() {
        let args = start_test_args(&config(), "10.0.0.5", r#"{"name":"x"}"#, Path::new("/runs"));
        assert_eq!(
            args,
            vec![
                "vxi11-api.py",
                "--ip",
                "10.0.0.5",
                "--start-test",
                r#"{"name":"x"}"#,
                "--savedir",
                "/runs"
            ]
        );
    }

    #[tokio::test]
    async fn test_discover_parses_devices() {
        let (launcher, mut children) = ScriptedLauncher::new();
        let helper = InstrumentHelper::new(
            Arc::new(launcher),
            config(),
            Arc::new(DeviceRegistry::new()),
        );

        let task = tokio::spawn(async move { helper.discover("10.0.0").await });
        let mut child = children.recv().await.unwrap();
        assert_eq!(child.program, "python3");
        assert_eq!(child.args, vec!["vxi11-api.py", "--discover", "10.0.0"]);

        child
            .say(r#"[{"id":"a","name":"DSOX1204G","address":"10.0.0.12","type":"KEYSIGHT","isConnected":false}]"#)
            .await;
        child.exit(Some(0));

        let devices = task.await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "10.0.0.12");
    }

    #[tokio::test]
    async fn test_discover_rejects_error_object() {
        let (launcher, mut children) = ScriptedLauncher::new();
        let helper = InstrumentHelper::new(
            Arc::new(launcher),
            config(),
            Arc::new(DeviceRegistry::new()),
        );

        let task = tokio::spawn(async move { helper.discover("10.0.0").await });
        let mut child = children.recv().await.unwrap();
        child.say(r#"{"error":"liblxi missing"}"#).await;
        child.exit(Some(0));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HelperError::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_command_needs_a_selected_device() {
        let (launcher, _children) = ScriptedLauncher::new();
        let launcher = Arc::new(launcher);
        let helper = InstrumentHelper::new(launcher.clone(), config(), Arc::new(DeviceRegistry::new()));

        let err = helper.send_command("*IDN?").await.unwrap_err();
        assert!(matches!(err, HelperError::NoDeviceSelected));
        assert_eq!(launcher.launched(), 0);
    }

    #[tokio::test]
    async fn test_command_reply_and_failure() {
        let (launcher, mut children) = ScriptedLauncher::new();
        let devices = Arc::new(DeviceRegistry::new());
        devices.set_selected_device(Device::at("10.0.0.5")).await;
        let helper = InstrumentHelper::new(Arc::new(launcher), config(), devices);

        let ok = {
            let helper = helper.clone();
            tokio::spawn(async move { helper.send_command("*IDN?").await })
        };
        let mut child = children.recv().await.unwrap();
        assert_eq!(
            child.args,
            vec!["vxi11-api.py", "--ip", "10.0.0.5", "--command", "*IDN?"]
        );
        child.say("KEYSIGHT,DSOX1204G,CN123,1.0  ").await;
        child.exit(Some(0));
        assert_eq!(ok.await.unwrap().unwrap(), "KEYSIGHT,DSOX1204G,CN123,1.0");

        let failed = tokio::spawn(async move { helper.send_command("BOGUS").await });
        let mut child = children.recv().await.unwrap();
        child.complain("VI_ERROR_TMO\n").await;
        child.exit(Some(1));

        match failed.await.unwrap().unwrap_err() {
            HelperError::Failed { exit, stderr } => {
                assert_eq!(exit.code, Some(1));
                assert_eq!(stderr, "VI_ERROR_TMO");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
