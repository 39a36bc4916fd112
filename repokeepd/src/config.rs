use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{APP_NAME, DEFAULT_PORT, SERVICE_BINARY};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fixed per-call timeout enforced by the request pipeline
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 0 disables idle shutdown
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_rotation_interval")]
    pub interval_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> u64 {
    30
}

fn default_idle_check_interval() -> u64 {
    5
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join("records.db")
}

fn default_max_age_days() -> u64 {
    90
}

fn default_initial_delay() -> u64 {
    60
}

fn default_rotation_interval() -> u64 {
    24 * 60 * 60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            idle_timeout_secs: 0,
            idle_check_interval_secs: default_idle_check_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_days: default_max_age_days(),
            initial_delay_secs: default_initial_delay(),
            interval_secs: default_rotation_interval(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}

impl RotationConfig {
    pub fn max_age(&self) -> chrono::Duration {
        let days = i64::try_from(self.max_age_days).unwrap_or(i64::MAX);
        chrono::Duration::try_days(days).unwrap_or(chrono::Duration::MAX)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    /// Default config file location, e.g. `~/.config/repokeep/repokeepd.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(format!("{}.toml", SERVICE_BINARY)))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path` if given, else from the default location. A missing
    /// default file means defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.service.port, DEFAULT_PORT);
        assert_eq!(config.service.request_timeout_secs, 30);
        assert_eq!(config.service.idle_timeout_secs, 0);
        assert!(!config.rotation.enabled);
        assert_eq!(config.rotation.max_age_days, 90);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [service]
            port = 50000
            idle_timeout_secs = 600

            [rotation]
            enabled = true
            interval_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.service.port, 50000);
        assert_eq!(config.service.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.service.idle_check_interval(), Duration::from_secs(5));
        assert!(config.rotation.enabled);
        assert_eq!(config.rotation.interval(), Duration::from_secs(3600));
        assert_eq!(config.rotation.initial_delay_secs, 60);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_or_default(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repokeepd.toml");
        std::fs::write(&path, "[store]\ndb_path = \"/tmp/x.db\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/x.db"));
    }
}
