//! Engine settings
//!
//! Defaults are usable as-is. A `settings.toml` in the data directory
//! overrides any subset of fields; `SENTIMENT_DATA_DIR` moves the data
//! directory itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "SENTIMENT_DATA_DIR";
pub const SETTINGS_FILE: &str = "settings.toml";
pub const DB_FILE: &str = "sentiment.db";
pub const KEY_FILE: &str = "audit.key";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    /// Ring buffer size of the live drift window
    pub drift_window: usize,
    /// Window size below which drift is never reported
    pub drift_min_samples: usize,
    /// Predictions captured as the baseline for a newly activated version
    pub drift_baseline_size: usize,
    /// Maximum `parent_config_id` chain length
    pub max_parent_depth: usize,
    pub cache_capacity: u64,
    pub bulk_concurrency: usize,
    /// Use the built-in keyword config when nothing resolves
    pub builtin_fallback: bool,
    pub provider_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            drift_window: 500,
            drift_min_samples: 50,
            drift_baseline_size: 100,
            max_parent_depth: 8,
            cache_capacity: 10_000,
            bulk_concurrency: 8,
            builtin_fallback: true,
            provider_timeout_ms: 10_000,
        }
    }
}

/// XDG data dir on Linux, ~/Library/Application Support on macOS
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sentiment-engine")
}

impl EngineSettings {
    /// Load `settings.toml` from the default data dir if present
    pub fn load() -> Result<Self> {
        let data_dir = default_data_dir();
        Self::load_from(&data_dir)
    }

    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {:?}", path))?;
            Self::from_toml(&raw)?
        } else {
            Self::default()
        };
        settings.data_dir = data_dir.to_path_buf();
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).context("Invalid settings.toml")?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.drift_window == 0 {
            anyhow::bail!("drift_window must be at least 1");
        }
        if self.drift_min_samples > self.drift_window {
            anyhow::bail!(
                "drift_min_samples ({}) exceeds drift_window ({})",
                self.drift_min_samples,
                self.drift_window
            );
        }
        if self.max_parent_depth == 0 {
            anyhow::bail!("max_parent_depth must be at least 1");
        }
        if self.bulk_concurrency == 0 {
            anyhow::bail!("bulk_concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }
}
