//! Configuration loading
//!
//! Loads configuration from `~/.config/pagetrail/pagetrail.toml` (or the
//! `PAGETRAIL_CONFIG` env var). A missing file yields the defaults.

use crate::errors::{IndexError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration shared by the index and the background component
#[derive(Debug, Deserialize, Clone)]
pub struct PagetrailConfig {
    /// Path to the SQLite index database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the legacy index database, if one exists
    #[serde(default)]
    pub legacy_db_path: Option<String>,

    /// Visit tracking settings
    #[serde(default)]
    pub visits: VisitConfig,

    /// Favicon fetch settings
    #[serde(default)]
    pub fav_icons: FavIconConfig,

    /// Legacy migration settings
    #[serde(default)]
    pub migration: MigrationConfig,
}

fn default_db_path() -> String {
    dirs::home_dir()
        .map(|h| {
            h.join(".config")
                .join("pagetrail")
                .join("index.db")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "index.db".to_string())
}

/// Visit tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VisitConfig {
    /// Visits with less active time than this never get interaction updates
    #[serde(default = "default_min_active_time_ms")]
    pub min_active_time_ms: u64,

    /// Whether incognito tabs may be logged at all
    #[serde(default)]
    pub log_incognito: bool,

    /// Host suffixes that are never logged (e.g. "bank.example")
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// URL schemes eligible for logging
    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,
}

fn default_min_active_time_ms() -> u64 {
    100
}

fn default_allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

impl Default for VisitConfig {
    fn default() -> Self {
        Self {
            min_active_time_ms: default_min_active_time_ms(),
            log_incognito: false,
            blacklist: Vec::new(),
            allowed_schemes: default_allowed_schemes(),
        }
    }
}

impl VisitConfig {
    pub fn min_active_time(&self) -> Duration {
        Duration::from_millis(self.min_active_time_ms)
    }
}

/// Favicon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FavIconConfig {
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

impl Default for FavIconConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

/// Legacy migration configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MigrationConfig {
    /// Master switch for the idle-time migrator
    #[serde(default = "default_migration_enabled")]
    pub enabled: bool,

    /// Legacy documents read per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// First retry delay after a failed batch
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Retries of one batch before the migrator parks until the next idle period
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_migration_enabled() -> bool {
    true
}
fn default_batch_size() -> usize {
    50
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> usize {
    5
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_migration_enabled(),
            batch_size: default_batch_size(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for PagetrailConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            legacy_db_path: None,
            visits: VisitConfig::default(),
            fav_icons: FavIconConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl PagetrailConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "PAGETRAIL_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "pagetrail.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `PAGETRAIL_CONFIG` environment variable
    /// 2. `~/.config/pagetrail/pagetrail.toml`
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "pagetrail config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            IndexError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: PagetrailConfig = toml::from_str(contents)
            .map_err(|e| IndexError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("pagetrail")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.migration.batch_size == 0 {
            return Err(IndexError::config("migration.batch_size must be at least 1"));
        }

        if self.migration.initial_backoff_ms > self.migration.max_backoff_ms {
            tracing::warn!(
                initial = self.migration.initial_backoff_ms,
                max = self.migration.max_backoff_ms,
                "migration initial backoff exceeds max backoff; max wins"
            );
        }

        if self.visits.allowed_schemes.is_empty() {
            tracing::warn!("visits.allowed_schemes is empty; no page will ever be logged");
        }

        Ok(())
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    pub fn resolved_legacy_db_path(&self) -> Option<PathBuf> {
        self.legacy_db_path.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}
