use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use slate::config::SlateConfig;
use slate::devices::Device;
use slate::helper::InstrumentHelper;
use slate::launcher::ProcessLauncher;
use slate::orchestrator::{TestParams, TestStatus};
use slate::settings::{Settings, SettingsStore};

#[derive(Parser)]
#[command(
    name = "slate",
    about = "S.L.A.T.E: long-running oscilloscope tests driven through an instrument helper",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (falls back to $SLATE_CONFIG, then ./slate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host (HTTP API + test orchestrator)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long, env = "SLATE_BIND")]
        bind: Option<String>,
    },

    /// Scan a subnet for LXI instruments
    Discover {
        /// First three octets, e.g. 192.168.1
        #[arg(long)]
        subnet: String,
    },

    /// Send one SCPI command and print the reply
    Command {
        /// Instrument address
        #[arg(long)]
        ip: String,

        /// SCPI command, e.g. "*IDN?"
        scpi: String,
    },

    /// Run a test in the foreground until it finishes (Ctrl-C stops it)
    Run {
        /// Instrument address
        #[arg(long)]
        ip: String,

        /// JSON file with the test parameters
        #[arg(long)]
        params: PathBuf,

        /// Directory for result files, defaults to the stored setting
        #[arg(long)]
        savedir: Option<PathBuf>,
    },

    /// Inspect or change stored settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the stored settings as JSON
    Show,

    /// Set the directory test results are written to
    SetSaveDir {
        /// Target directory
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SlateConfig::resolve(cli.config.as_deref())?;
    slate::init_tracing(&config.logging)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting S.L.A.T.E host");
            slate::serve(config).await?;
        }
        Commands::Discover { subnet } => {
            let helper = one_shot_helper(&config);
            let devices = helper.discover(&subnet).await?;
            if devices.is_empty() {
                println!("No instruments found on {}.x", subnet);
            } else {
                println!("{:<16} | {:<24} | Type", "Address", "Name");
                println!("{:-<16}-|-{:-<24}-|-{:-<12}", "", "", "");
                for device in devices {
                    println!(
                        "{:<16} | {:<24} | {}",
                        device.address,
                        device.name,
                        device.kind.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Command { ip, scpi } => {
            let helper = one_shot_helper(&config);
            let reply = helper.send_command_to(&ip, &scpi).await?;
            println!("{}", reply);
        }
        Commands::Run {
            ip,
            params,
            savedir,
        } => {
            run_foreground(&config, ip, params, savedir).await?;
        }
        Commands::Settings { action } => {
            let store = SettingsStore::open(&config.settings.path)
                .await
                .context("failed to open settings store")?;
            match action {
                SettingsAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&store.snapshot().await)?);
                }
                SettingsAction::SetSaveDir { dir } => {
                    store.set_save_directory(Some(dir.clone())).await?;
                    println!("Save directory set to {}", dir.display());
                }
            }
        }
    }

    Ok(())
}

fn one_shot_helper(config: &SlateConfig) -> InstrumentHelper {
    let state = slate::assemble(
        config,
        Arc::new(ProcessLauncher),
        Arc::new(SettingsStore::in_memory(Settings::default())),
    );
    state.helper
}

async fn run_foreground(
    config: &SlateConfig,
    ip: String,
    params: PathBuf,
    savedir: Option<PathBuf>,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(&params)
        .await
        .with_context(|| format!("failed to read {}", params.display()))?;
    let params: TestParams = serde_json::from_str(&raw)
        .with_context(|| format!("invalid test parameters in {}", params.display()))?;

    let save_directory = match savedir {
        Some(dir) => Some(dir),
        None => SettingsStore::open(&config.settings.path)
            .await
            .context("failed to open settings store")?
            .save_directory()
            .await,
    };
    let settings = SettingsStore::in_memory(Settings {
        save_directory,
        tests: Vec::new(),
    });

    let state = slate::assemble(config, Arc::new(ProcessLauncher), Arc::new(settings));
    state.devices.set_selected_device(Device::at(ip)).await;
    let orchestrator = state.orchestrator;

    let mut events = orchestrator.subscribe();
    let record = orchestrator.start_test(params).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.test_id == record.test_id => {
                    println!("Test {} finished: {}", event.test_id, event.status);
                    if event.status == TestStatus::Failed {
                        bail!("test {} failed", event.test_id);
                    }
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let stopped = orchestrator.stop_test(&record.test_id).await?;
                println!("Test {} stopped.", stopped.test_id);
                break;
            }
        }
    }

    Ok(())
}
