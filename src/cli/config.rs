use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::state::{DEFAULT_MAX_CHECKPOINTS, StateManagerConfig};

/// Database used by the command-line tool when nothing else is configured.
pub const DEFAULT_DB_PATH: &str = "data/diagflow.db";

/// Configuration loaded from `diagflow.yaml`.
/// Every field is optional; unset ones fall back to `--db`/env, then defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DiagflowConfig {
    pub db_path: Option<String>,
    pub enable_auto_save: Option<bool>,
    pub max_checkpoints: Option<usize>,
    pub auto_save_interval_ms: Option<u64>,
}

impl DiagflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `diagflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("diagflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: DiagflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Merge with a command-line database override into manager options.
    /// Precedence: override, then file, then defaults.
    pub fn resolve(&self, db_override: Option<&str>) -> StateManagerConfig {
        StateManagerConfig {
            db_path: db_override
                .map(str::to_string)
                .or_else(|| self.db_path.clone())
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            enable_auto_save: self.enable_auto_save.unwrap_or(false),
            max_checkpoints: self.max_checkpoints.unwrap_or(DEFAULT_MAX_CHECKPOINTS),
            auto_save_interval_ms: self.auto_save_interval_ms,
        }
    }
}
