//! Flat JSON settings store: the chosen save directory and the user's test
//! templates.
//!
//! The store is handed to the orchestrator at construction time rather than
//! reached through a global. Every mutation is written through to disk with a
//! temp-file + rename so a crash never leaves a half-written document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub save_directory: Option<PathBuf>,
    #[serde(default)]
    pub tests: Vec<TestTemplate>,
}

/// A user-authored test definition. Stored, never executed directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTemplate {
    pub id: String,
    pub name: String,
    /// Requested run time in minutes (0.5 = thirty seconds).
    #[serde(default)]
    pub duration: f64,
    /// Seconds between measurement rounds.
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub chain_commands: bool,
    #[serde(default)]
    pub commands: Vec<CommandStep>,
    /// Leading CSV column: `Timestamp`, `Index` or `Both`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_col: Option<String>,
    /// UI-only fields (`isExpanded`, ...) survive a load/save cycle untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One SCPI command inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStep {
    pub command: String,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub no_timeout: bool,
    /// Seconds to wait after the command.
    #[serde(default)]
    pub wait_after: f64,
}

/// Settings cached in memory, optionally backed by a file.
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Open the store at `path`. A missing file yields empty settings; the
    /// file is created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file yet, starting empty");
                Settings::default()
            }
            Err(source) => return Err(SettingsError::Io { path, source }),
        };

        info!(path = %path.display(), templates = data.tests.len(), "settings loaded");
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(initial: Settings) -> Self {
        Self {
            path: None,
            data: RwLock::new(initial),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> Settings {
        self.data.read().await.clone()
    }

    pub async fn save_directory(&self) -> Option<PathBuf> {
        self.data.read().await.save_directory.clone()
    }

    pub async fn set_save_directory(&self, dir: Option<PathBuf>) -> Result<(), SettingsError> {
        self.update(|next| next.save_directory = dir).await
    }

    pub async fn tests(&self) -> Vec<TestTemplate> {
        self.data.read().await.tests.clone()
    }

    /// Replace the whole template list.
    pub async fn save_tests(&self, tests: Vec<TestTemplate>) -> Result<(), SettingsError> {
        self.update(|next| next.tests = tests).await
    }

    /// Apply `change` to a copy, write it out, then swap it in. Memory only
    /// changes once the file does.
    async fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<(), SettingsError> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        change(&mut next);
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    // Called with the write guard held so concurrent writers serialize.
    async fn persist(&self, data: &Settings) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_err = |source| SettingsError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

        debug!(path = %path.display(), bytes = json.len(), "settings written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
