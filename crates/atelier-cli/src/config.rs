use atelier_agents::ModelConfig;
use atelier_core::{AtelierError, AtelierResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level `atelier.toml` configuration.
#[derive(Debug, Deserialize)]
pub struct AtelierConfig {
    /// Completion-service settings.
    pub model: ModelConfig,
    /// Directory holding the store and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root of the project the agents operate on.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Command run by the typecheck tool, split on whitespace.
    #[serde(default = "default_typecheck_command")]
    pub typecheck_command: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_typecheck_command() -> String {
    "cargo check --quiet".to_string()
}

impl AtelierConfig {
    /// Load configuration from a TOML file. The API key may be left
    /// empty in the file and supplied via `ATELIER_API_KEY`.
    pub fn load(path: &Path) -> AtelierResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AtelierError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: AtelierConfig = toml::from_str(&raw)
            .map_err(|e| AtelierError::Config(format!("invalid config: {e}")))?;
        if config.model.api_key.is_empty() {
            if let Ok(key) = std::env::var("ATELIER_API_KEY") {
                config.model.api_key = key;
            }
        }
        Ok(config)
    }

    /// Path of the SQLite store inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("atelier.db")
    }
}
