use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Settings consumed by the consultation controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationSettings {
    pub assistant_id: String,
    pub await_engine_report: bool,
    pub report_grace: Duration,
    pub tick_interval: Duration,
    pub recent_consultation_limit: usize,
}

impl Default for ConsultationSettings {
    fn default() -> Self {
        Config::default().consultation_settings()
    }
}

/// Persisted configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    /// Assistant configured on the voice platform
    pub assistant_id: String,
    /// Wait for the engine's end-of-call report after a plain call end
    pub await_engine_report: bool,
    /// How long to wait for that report before summarizing locally
    pub report_grace_secs: u64,
    pub tick_interval_ms: u64,
    pub recent_consultation_limit: usize,
    pub archive_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: 1,
            assistant_id: "health-consultation".to_string(),
            await_engine_report: true,
            report_grace_secs: 5,
            tick_interval_ms: 1000,
            recent_consultation_limit: 3,
            archive_dir: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".voiceconsult"))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location or return default
    pub fn load_or_default() -> Self {
        match Self::config_path().and_then(|p| Self::load_from(&p)) {
            Ok(config) => config,
            Err(e) => {
                debug!("Failed to load config, using default: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from a file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = serde_json::from_str(&content).context("Invalid config JSON")?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Archive location, defaulting to ~/.voiceconsult/archive
    pub fn get_archive_dir(&self) -> Result<PathBuf> {
        match self.archive_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("archive")),
        }
    }

    /// Log location, defaulting to ~/.voiceconsult/logs
    pub fn get_log_dir(&self) -> Result<PathBuf> {
        match self.log_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("logs")),
        }
    }

    pub fn consultation_settings(&self) -> ConsultationSettings {
        ConsultationSettings {
            assistant_id: self.assistant_id.clone(),
            await_engine_report: self.await_engine_report,
            report_grace: Duration::from_secs(self.report_grace_secs),
            // A zero interval would spin the ticker
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            recent_consultation_limit: self.recent_consultation_limit,
        }
    }
}
