use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::instance::StateTable;
use crate::paths::{config_path, ensure_data_dirs, get_data_dir};

static CONFIG_LOCK: Mutex<()> = Mutex::new(());
static CONFIG_CACHE: OnceLock<RwLock<Arc<AppConfig>>> = OnceLock::new();

fn load_config_from_disk() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        let config = AppConfig::default();
        save_config_to_disk(&config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(&path).map_err(|e| AppError::config(e.to_string()))?;
    let config: AppConfig = toml::from_str(&content)?;
    config.state_table.check()?;
    Ok(config)
}

fn save_config_to_disk(config: &AppConfig) -> Result<()> {
    ensure_data_dirs()?;
    let content = toml::to_string_pretty(config)?;
    fs::write(config_path(), content).map_err(|e| AppError::config(e.to_string()))
}

fn get_config_cache() -> Result<&'static RwLock<Arc<AppConfig>>> {
    if let Some(cache) = CONFIG_CACHE.get() {
        return Ok(cache);
    }

    let config = load_config_from_disk()?;
    let _ = CONFIG_CACHE.set(RwLock::new(Arc::new(config)));

    CONFIG_CACHE
        .get()
        .ok_or_else(|| AppError::config("CONFIG_CACHE not initialized"))
}

/// Execute a read-modify-write operation on the config file while holding a lock.
pub fn with_config_mut<F, T>(f: F) -> Result<T>
where
    F: FnOnce(&mut AppConfig) -> Result<T>,
{
    let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cache = get_config_cache()?;

    let current = {
        let config = cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    };

    let mut updated = (*current).clone();
    let result = f(&mut updated)?;
    save_config_to_disk(&updated)?;

    *cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

    Ok(result)
}

pub fn load_config() -> Result<Arc<AppConfig>> {
    let cache = get_config_cache()?;
    let config = cache.read().unwrap_or_else(|e| e.into_inner());
    Ok(Arc::clone(&config))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Terminal multiplexer binary.
    #[serde(default = "default_multiplexer")]
    pub multiplexer: String,
    /// Shell used to wrap every multiplexer invocation.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Identity of the local host, assigned on first registration.
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default = "default_host_name")]
    pub host_name: String,
    #[serde(default = "default_host_address")]
    pub host_address: String,
    /// Base directory for instance and world data; defaults to `<data dir>/host`.
    #[serde(default)]
    pub host_base_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_table: StateTable,
    /// Server version references instances may be created with.
    #[serde(default)]
    pub installed_versions: Vec<String>,
    /// Launch script, relative to an instance's location.
    #[serde(default = "default_boot_program")]
    pub boot_program: String,
    /// Console output marking the end of a boot.
    #[serde(default = "default_boot_marker")]
    pub boot_marker: String,
}

fn default_multiplexer() -> String {
    "tmux".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_host_name() -> String {
    "local".to_string()
}

fn default_host_address() -> String {
    "127.0.0.1".to_string()
}

fn default_boot_program() -> String {
    "start-server.sh".to_string()
}

fn default_boot_marker() -> String {
    "Server started".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            multiplexer: default_multiplexer(),
            shell: default_shell(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            host_id: None,
            host_name: default_host_name(),
            host_address: default_host_address(),
            host_base_dir: None,
            state_table: StateTable::default(),
            installed_versions: Vec::new(),
            boot_program: default_boot_program(),
            boot_marker: default_boot_marker(),
        }
    }
}

impl AppConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn host_base_dir(&self) -> PathBuf {
        self.host_base_dir
            .clone()
            .unwrap_or_else(|| get_data_dir().join("host"))
    }

    pub fn ensure_version_installed(&self, version: &str) -> Result<()> {
        if self.installed_versions.iter().any(|v| v == version) {
            Ok(())
        } else {
            Err(AppError::version_not_found(version))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.multiplexer, "tmux");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.host_id.is_none());
        assert!(config.state_table.check().is_ok());
    }

    #[test]
    fn state_table_can_be_supplied() {
        let config: AppConfig = toml::from_str(
            r#"
            installed_versions = ["v1.4.4.9"]

            [state_table]
            inactive = ["IDLE", "CRASHED"]
            active = ["BOOTING_UP", "RUNNING", "SHUTTING_DOWN", "SAVING"]
            "#,
        )
        .unwrap();
        assert!(config.state_table.active.iter().any(|s| s.as_str() == "SAVING"));
        assert!(config.ensure_version_installed("v1.4.4.9").is_ok());
        assert!(config.ensure_version_installed("v2").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.host_id = Some("abc".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.host_id.as_deref(), Some("abc"));
    }
}
