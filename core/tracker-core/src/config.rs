//! Runtime configuration for the tracker.
//!
//! Loaded from `~/.tabtime/daemon/config.toml`. A missing file yields the
//! defaults; a malformed one is an error so the daemon can log it and fall
//! back explicitly.

use chrono::{Duration, FixedOffset, Local, Offset};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};

const TABTIME_DIR: &str = ".tabtime";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = "daemon/config.toml";

const DEFAULT_GRACE_PERIOD_SECS: u64 = 120;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_STALE_AFTER_SECS: u64 = 90;
const DEFAULT_CLASSIFIER_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CategoryRule {
    pub category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommandClassifierConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClassifierConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<CategoryRule>,
    /// Consulted after the rule table when set.
    #[serde(default)]
    pub command: Option<CommandClassifierConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct ExportConfig {
    /// Drive sync folder; defaults to `~/.tabtime/drive`.
    #[serde(default)]
    pub sync_dir: Option<PathBuf>,
    /// 32-byte AES key file; generated on first export.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Offset used to pick a record's calendar date. Unset means the local
    /// offset at daemon start.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub ignored_domains: Vec<String>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            utc_offset_minutes: None,
            ignored_domains: Vec::new(),
            classifier: ClassifierConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn grace_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_period_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs.min(i64::MAX as u64) as i64)
    }

    /// Configured offset, or the machine's current local offset.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .unwrap_or_else(|| Local::now().offset().fix())
    }

    pub fn sync_dir(&self) -> Result<PathBuf> {
        match &self.export.sync_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(tabtime_dir()?.join("drive")),
        }
    }

    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.export.key_path {
            Some(path) => Ok(path.clone()),
            None => Ok(tabtime_dir()?.join("daemon").join("export.key")),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}

fn default_classifier_timeout_ms() -> u64 {
    DEFAULT_CLASSIFIER_TIMEOUT_MS
}

fn default_rules() -> Vec<CategoryRule> {
    vec![
        CategoryRule {
            category: "Social Media".to_string(),
            subcategories: Vec::new(),
            domains: vec![
                "facebook.com".to_string(),
                "twitter.com".to_string(),
                "instagram.com".to_string(),
            ],
        },
        CategoryRule {
            category: "News".to_string(),
            subcategories: Vec::new(),
            domains: vec![
                "cnn.com".to_string(),
                "bbc.com".to_string(),
                "nytimes.com".to_string(),
            ],
        },
    ]
}

/// Returns `~/.tabtime`.
pub fn tabtime_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| TrackerError::Io {
        context: "resolving home directory".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "Home directory not found"),
    })?;
    Ok(home.join(TABTIME_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(tabtime_dir()?.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(TrackerConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| TrackerError::Io {
        context: format!("reading config {}", config_path.display()),
        source,
    })?;
    parse_config(&content, &config_path)
}

pub fn parse_config(content: &str, path: &Path) -> Result<TrackerConfig> {
    toml::from_str::<TrackerConfig>(content).map_err(|err| TrackerError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
