//! TOML configuration for the SLATE host.
//!
//! Layered model: an explicit path from the command line, then the
//! `SLATE_CONFIG` environment variable, then `slate.toml` in the working
//! directory, then compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "SLATE_CONFIG";

/// File looked up in the working directory when nothing else is given.
pub const LOCAL_CONFIG_FILE: &str = "slate.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the host process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlateConfig {
    #[serde(default)]
    pub helper: HelperConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SlateConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicit path must load; a missing or broken file there is an
    /// error. The environment and working-directory fallbacks only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SLATE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Helper program
// ---------------------------------------------------------------------------

/// The external instrument helper invoked for discovery, commands and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Program to execute (bare names are resolved via `$PATH`).
    pub program: String,
    /// Arguments placed before the operation flags, typically the script path.
    pub args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["services/python/vxi11-api.py".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the host API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7410".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// JSON file holding the save directory and test templates.
    pub path: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/slate-settings.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Finished test records kept before the oldest is evicted.
    pub max_completed: usize,
    /// Capacity of the completion event channel per subscriber.
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_completed: 100,
            event_buffer: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SlateConfig::default();

        assert_eq!(cfg.helper.program, "python3");
        assert_eq!(cfg.helper.args, vec!["services/python/vxi11-api.py"]);
        assert_eq!(cfg.server.bind, "127.0.0.1:7410");
        assert_eq!(cfg.settings.path, PathBuf::from("data/slate-settings.json"));
        assert_eq!(cfg.orchestrator.max_completed, 100);
        assert_eq!(cfg.orchestrator.event_buffer, 64);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[helper]
program = "/opt/slate/venv/bin/python"
args = ["/opt/slate/vxi11-api.py", "--quiet"]

[server]
bind = "0.0.0.0:9000"

[settings]
path = "/var/lib/slate/settings.json"

[orchestrator]
max_completed = 10
event_buffer = 8

[logging]
level = "debug"
json = true
"#;

        let cfg: SlateConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.helper.program, "/opt/slate/venv/bin/python");
        assert_eq!(cfg.helper.args.len(), 2);
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.settings.path, PathBuf::from("/var/lib/slate/settings.json"));
        assert_eq!(cfg.orchestrator.max_completed, 10);
        assert_eq!(cfg.orchestrator.event_buffer, 8);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: SlateConfig = toml::from_str(
            r#"
[helper]
program = "python"
"#,
        )
        .unwrap();

        assert_eq!(cfg.helper.program, "python");
        // Field-level default inside a present section.
        assert_eq!(cfg.helper.args, vec!["services/python/vxi11-api.py"]);
        assert_eq!(cfg.server.bind, "127.0.0.1:7410");
        assert_eq!(cfg.orchestrator.max_completed, 100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slate.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        let cfg = SlateConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = SlateConfig::resolve(Some(Path::new("/nonexistent/slate.toml")));
        assert!(result.is_err());
    }
}
