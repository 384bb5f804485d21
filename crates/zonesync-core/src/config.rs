//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/zonesync/config.toml)
//! 3. Environment variables (ZONESYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "ZONESYNC";

/// Shortest accepted sync interval
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Longest accepted sync interval
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(1200);

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the zone database and the JSON fallback file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Sync server base URL (optional)
    #[serde(default)]
    pub sync_url: Option<String>,

    /// Sync group: which remote collection of zones this client reconciles
    #[serde(default)]
    pub sync_group: Option<String>,

    /// Seconds between successful sync cycles (clamped to 5..=1200)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// SQLite lock-wait timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Base delay between lock-contention retries
    #[serde(default = "default_lock_retry_base")]
    pub lock_retry_base_ms: u64,

    /// Base delay between HTTP retries
    #[serde(default = "default_http_retry_base")]
    pub http_retry_base_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_enabled: false,
            sync_url: None,
            sync_group: None,
            sync_interval_secs: default_sync_interval(),
            busy_timeout_ms: default_busy_timeout(),
            lock_retry_base_ms: default_lock_retry_base(),
            http_retry_base_ms: default_http_retry_base(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (ZONESYNC_DATA_DIR, ZONESYNC_SYNC_URL, ...)
    /// 2. Config file (~/.config/zonesync/config.toml or ZONESYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build a configuration rooted at `data_dir` with everything else defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_URL", ENV_PREFIX)) {
            self.sync_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_GROUP", ENV_PREFIX)) {
            self.sync_group = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_INTERVAL", ENV_PREFIX)) {
            match val.parse() {
                Ok(secs) => self.sync_interval_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid {}_SYNC_INTERVAL: {}", ENV_PREFIX, val),
            }
        }
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with ZONESYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zonesync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("areas.db")
    }

    /// Get the path to the JSON fallback document
    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join("areas.json")
    }

    /// Snapshot of the settings the sync engine reads
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            enabled: self.sync_enabled,
            server_url: self.sync_url.clone(),
            sync_group: self.sync_group.clone(),
            interval_secs: self.sync_interval_secs,
            retry_base: Duration::from_millis(self.http_retry_base_ms),
        }
    }
}

/// Sync-related settings handed to the engine and the remote client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub enabled: bool,
    pub server_url: Option<String>,
    pub sync_group: Option<String>,
    pub interval_secs: u64,
    pub retry_base: Duration,
}

impl SyncSettings {
    /// True when both a server URL and a sync group are set
    pub fn is_configured(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.server_url) && filled(&self.sync_group)
    }

    /// Enabled and configured
    pub fn is_active(&self) -> bool {
        self.enabled && self.is_configured()
    }

    /// Interval between successful cycles, clamped to the accepted range
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs).clamp(MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL)
    }

    pub fn group(&self) -> Option<&str> {
        self.sync_group.as_deref().filter(|g| !g.trim().is_empty())
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Config::default().sync_settings()
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zonesync")
}

fn default_sync_interval() -> u64 {
    300
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_lock_retry_base() -> u64 {
    500
}

fn default_http_retry_base() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "ZONESYNC_DATA_DIR",
        "ZONESYNC_SYNC_URL",
        "ZONESYNC_SYNC_ENABLED",
        "ZONESYNC_SYNC_GROUP",
        "ZONESYNC_SYNC_INTERVAL",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.sync_url.is_none());
        assert!(config.sync_group.is_none());
        assert_eq!(config.sync_interval_secs, 300);
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(config.data_dir.ends_with("zonesync"));
    }

    #[test]
    fn test_file_paths() {
        let config = Config::with_data_dir("/data/zones");
        assert_eq!(config.database_path(), PathBuf::from("/data/zones/areas.db"));
        assert_eq!(config.document_path(), PathBuf::from("/data/zones/areas.json"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(!config.sync_enabled);

        env::set_var("ZONESYNC_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("ZONESYNC_SYNC_ENABLED", "1");
        config.sync_enabled = false;
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("ZONESYNC_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_sync_url_and_group() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("ZONESYNC_SYNC_URL", "http://localhost:8000");
        env::set_var("ZONESYNC_SYNC_GROUP", "guild-a");
        config.apply_env_overrides();
        assert_eq!(config.sync_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.sync_group.as_deref(), Some("guild-a"));

        // Empty string clears it
        env::set_var("ZONESYNC_SYNC_URL", "");
        config.apply_env_overrides();
        assert!(config.sync_url.is_none());
    }

    #[test]
    fn test_env_override_interval_ignores_garbage() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("ZONESYNC_SYNC_INTERVAL", "soon");
        config.apply_env_overrides();
        assert_eq!(config.sync_interval_secs, 300);

        env::set_var("ZONESYNC_SYNC_INTERVAL", "60");
        config.apply_env_overrides();
        assert_eq!(config.sync_interval_secs, 60);
    }

    #[test]
    fn test_sync_interval_is_clamped() {
        let mut settings = SyncSettings::default();

        settings.interval_secs = 1;
        assert_eq!(settings.interval(), Duration::from_secs(5));

        settings.interval_secs = 90_000;
        assert_eq!(settings.interval(), Duration::from_secs(1200));

        settings.interval_secs = 60;
        assert_eq!(settings.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_sync_settings_configured() {
        let mut settings = SyncSettings::default();
        assert!(!settings.is_configured());

        settings.server_url = Some("http://sync".to_string());
        settings.sync_group = Some("  ".to_string());
        assert!(!settings.is_configured());

        settings.sync_group = Some("guild".to_string());
        assert!(settings.is_configured());
        assert!(!settings.is_active());

        settings.enabled = true;
        assert!(settings.is_active());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            sync_url = "http://example.com"
            sync_group = "guild"
            sync_enabled = true
            sync_interval_secs = 30
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.sync_url.as_deref(), Some("http://example.com"));
        assert_eq!(config.sync_group.as_deref(), Some("guild"));
        assert!(config.sync_enabled);
        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.lock_retry_base_ms, 500);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::with_data_dir(temp_dir.path().join("data"));
        config.sync_group = Some("guild".to_string());
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.sync_group.as_deref(), Some("guild"));
        assert!(loaded.data_dir.exists());
    }
}
