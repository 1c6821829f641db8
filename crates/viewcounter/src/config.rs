//! Configuration management for viewcounter.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "viewcounter";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "counters.db";

/// Default session directory name (inside the data directory).
const SESSION_DIR_NAME: &str = "sessions";

/// Page ids are short, URL-safe identifiers.
const PAGE_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$";

/// Longest animation we accept; anything slower reads as a stuck counter.
const MAX_ANIMATION_DURATION_MS: u64 = 60_000;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `VIEWCOUNTER_`, sections split on `__`)
/// 2. TOML config file at `~/.config/viewcounter/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Counter store configuration.
    pub store: StoreConfig,
    /// View counting configuration.
    pub counter: CounterConfig,
    /// Display projection configuration.
    pub display: DisplayConfig,
    /// Session gate configuration.
    pub session: SessionConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/viewcounter/counters.db`
    pub database_path: Option<PathBuf>,
    /// Identifier of the counted page.
    pub page_id: String,
    /// How often the store polls for commits made by other connections.
    pub watch_interval_ms: u64,
}

/// View counting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Continuous visible time required before a view is counted.
    pub minimum_dwell_ms: u64,
}

/// Display projection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Duration of the count animation. Zero disables animation.
    pub animation_duration_ms: u64,
    /// Interval between animation frames.
    pub frame_interval_ms: u64,
}

/// Session gate configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding file-backed session records.
    /// Defaults to `~/.local/share/viewcounter/sessions`
    pub session_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Resolved to default at runtime
            page_id: "main".to_string(),
            watch_interval_ms: 1_000,
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            minimum_dwell_ms: 5_000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            animation_duration_ms: 2_000,
            frame_interval_ms: 16,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            // VIEWCOUNTER_LOG holds log directives, not a config key
            .merge(Env::prefixed("VIEWCOUNTER_").ignore(&["log"]).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        validate_page_id(&self.store.page_id)?;

        if self.store.watch_interval_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "watch_interval_ms must be greater than 0".to_string(),
            });
        }

        if self.display.frame_interval_ms == 0 {
            return Err(Error::ConfigValidation {
                message: "frame_interval_ms must be greater than 0".to_string(),
            });
        }

        if self.display.animation_duration_ms > MAX_ANIMATION_DURATION_MS {
            return Err(Error::ConfigValidation {
                message: format!(
                    "animation_duration_ms ({}) cannot exceed {MAX_ANIMATION_DURATION_MS}",
                    self.display.animation_duration_ms
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the session directory, resolving defaults if not set.
    #[must_use]
    pub fn session_dir(&self) -> PathBuf {
        self.session
            .session_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(SESSION_DIR_NAME))
    }

    /// Get the minimum dwell as a Duration.
    #[must_use]
    pub fn minimum_dwell(&self) -> Duration {
        Duration::from_millis(self.counter.minimum_dwell_ms)
    }

    /// Get the animation duration as a Duration.
    #[must_use]
    pub fn animation_duration(&self) -> Duration {
        Duration::from_millis(self.display.animation_duration_ms)
    }

    /// Get the animation frame interval as a Duration.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.display.frame_interval_ms)
    }

    /// Get the store watch interval as a Duration.
    #[must_use]
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.store.watch_interval_ms)
    }
}

/// Check that a page id is usable as a counter key.
///
/// # Errors
///
/// Returns a validation error if the id is empty, too long, or contains
/// characters outside `[A-Za-z0-9_.:-]`.
pub fn validate_page_id(page_id: &str) -> Result<()> {
    let pattern = regex::Regex::new(PAGE_ID_PATTERN)
        .map_err(|e| Error::internal(format!("bad page id pattern: {e}")))?;
    if pattern.is_match(page_id) {
        Ok(())
    } else {
        Err(Error::ConfigValidation {
            message: format!("invalid page_id: {page_id:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.store.page_id, "main");
        assert_eq!(config.counter.minimum_dwell_ms, 5_000);
        assert_eq!(config.display.animation_duration_ms, 2_000);
        assert_eq!(config.display.frame_interval_ms, 16);
        assert!(config.session.session_dir.is_none());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bad_page_id() {
        let mut config = Config::default();
        config.store.page_id = "has spaces".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("page_id"));
    }

    #[test]
    fn test_validate_empty_page_id() {
        assert!(validate_page_id("").is_err());
        assert!(validate_page_id("view-count-key").is_ok());
        assert!(validate_page_id("blog:2024.post_1").is_ok());
    }

    #[test]
    fn test_validate_zero_frame_interval() {
        let mut config = Config::default();
        config.display.frame_interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("frame_interval_ms"));
    }

    #[test]
    fn test_validate_zero_watch_interval() {
        let mut config = Config::default();
        config.store.watch_interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("watch_interval_ms"));
    }

    #[test]
    fn test_validate_animation_too_long() {
        let mut config = Config::default();
        config.display.animation_duration_ms = MAX_ANIMATION_DURATION_MS + 1;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("animation_duration_ms"));
    }

    #[test]
    fn test_zero_dwell_is_allowed() {
        let mut config = Config::default();
        config.counter.minimum_dwell_ms = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.minimum_dwell(), Duration::ZERO);
    }

    #[test]
    fn test_database_path_default() {
        let path = Config::default().database_path();
        assert!(path.to_string_lossy().contains("counters.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.store.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_session_dir_default() {
        let path = Config::default().session_dir();
        assert!(path.to_string_lossy().contains("sessions"));
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.minimum_dwell(), Duration::from_secs(5));
        assert_eq!(config.animation_duration(), Duration::from_secs(2));
        assert_eq!(config.frame_interval(), Duration::from_millis(16));
        assert_eq!(config.watch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("viewcounter"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "viewcounter_config_test_{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[store]\npage_id = \"portfolio\"\n\n[counter]\nminimum_dwell_ms = 1500\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path.clone())).unwrap();
        assert_eq!(config.store.page_id, "portfolio");
        assert_eq!(config.counter.minimum_dwell_ms, 1500);
        assert_eq!(config.display, DisplayConfig::default());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "viewcounter_bad_config_test_{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[display]\nframe_interval_ms = 0\n").unwrap();

        assert!(Config::load_from(Some(path.clone())).is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_store_config_deserialize() {
        let json = r#"{"page_id": "home"}"#;
        let store: StoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(store.page_id, "home");
        assert_eq!(store.watch_interval_ms, 1_000);
    }
}
