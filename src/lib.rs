//! S.L.A.T.E -- host for long-running oscilloscope tests.
//!
//! Tests run inside an external instrument helper process. This crate starts
//! those helpers, tracks each test from spawn to exit, and serves the results
//! to a UI over HTTP.

pub mod api;
pub mod config;
pub mod devices;
pub mod helper;
pub mod launcher;
pub mod orchestrator;
pub mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::api::state::AppState;
use crate::config::{LoggingConfig, SlateConfig};
use crate::devices::DeviceRegistry;
use crate::helper::InstrumentHelper;
use crate::launcher::{Launcher, ProcessLauncher};
use crate::orchestrator::Orchestrator;
use crate::settings::SettingsStore;

/// Install the global tracing subscriber. `RUST_LOG` wins over the config.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let layer = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Wire the host components around one launcher and settings store.
pub fn assemble(
    config: &SlateConfig,
    launcher: Arc<dyn Launcher>,
    settings: Arc<SettingsStore>,
) -> AppState {
    let devices = Arc::new(DeviceRegistry::new());
    let orchestrator = Orchestrator::new(
        launcher.clone(),
        config.helper.clone(),
        devices.clone(),
        settings.clone(),
        &config.orchestrator,
    );
    let helper = InstrumentHelper::new(launcher, config.helper.clone(), devices.clone());

    AppState {
        orchestrator,
        devices,
        settings,
        helper,
    }
}

/// Start the host: HTTP API in front of the test orchestrator.
///
/// Ctrl-C kills every ongoing helper, then lets in-flight requests drain.
pub async fn serve(config: SlateConfig) -> Result<()> {
    tracing::info!(path = %config.settings.path.display(), "Opening settings");
    let settings = SettingsStore::open(&config.settings.path)
        .await
        .context("failed to open settings store")?;

    let state = assemble(&config, Arc::new(ProcessLauncher), Arc::new(settings));
    let orchestrator = state.orchestrator.clone();

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, helper = %config.helper.program, "S.L.A.T.E host listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Shutdown requested");
            orchestrator.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
