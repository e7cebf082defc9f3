//! Engine configuration
//!
//! Read from `~/.kiln/config.json`, then overlaid key by key with the
//! project's `kiln.config.json`. Missing files leave the defaults alone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::DigestAlgorithm;
use crate::error::EngineError;
use crate::scheduler::FailurePolicy;

pub const PROJECT_CONFIG_FILE: &str = "kiln.config.json";
const DEFAULT_STATE_DIR: &str = ".kiln";

/// Build cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildCacheConfig {
    pub enabled: bool,
    /// Defaults to `<state_dir>/build-cache`
    pub directory: Option<PathBuf>,
}

impl Default for BuildCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count; `None` means one per core
    pub workers: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub digest_algorithm: DigestAlgorithm,
    /// Relative paths are resolved against the project root
    pub state_dir: Option<PathBuf>,
    pub build_cache: BuildCacheConfig,
    pub default_timeout_secs: Option<u64>,
}

impl EngineConfig {
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        })
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        let dir = self
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        if dir.is_absolute() {
            dir
        } else {
            root.join(dir)
        }
    }

    pub fn build_cache_dir(&self, root: &Path) -> PathBuf {
        match &self.build_cache.directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => self.state_dir(root).join("build-cache"),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == Some(0) {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.default_timeout_secs == Some(0) {
            return Err(EngineError::Config("default_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Get the user-level config path (`~/.kiln/config.json`)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("config.json")
}

/// Load the user config, overlaid with the project config under `root`
pub fn load_config(root: &Path) -> Result<EngineConfig> {
    load_layered(&[get_config_path(), root.join(PROJECT_CONFIG_FILE)])
}

/// Load config files in order; later files override earlier keys
pub fn load_layered(paths: &[PathBuf]) -> Result<EngineConfig> {
    let mut merged = Value::Object(Default::default());
    for path in paths {
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let layer: Value = serde_json::from_str(&content)
            .with_context(|| format!("Malformed config {}", path.display()))?;
        tracing::debug!("Loaded config layer {:?}", path);
        overlay(&mut merged, layer);
    }

    let config: EngineConfig =
        serde_json::from_value(merged).context("Invalid engine configuration")?;
    config.validate()?;
    Ok(config)
}

fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                if let Some(existing) = base.get_mut(&key) {
                    if existing.is_object() && value.is_object() {
                        overlay(existing, value);
                        continue;
                    }
                }
                base.insert(key, value);
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Save config to disk as pretty JSON
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}
