//! Centralized path utilities for the application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "FLEETKEEPER_HOME";

/// Get the root data directory for the application (~/.fleetkeeper).
#[allow(clippy::expect_used)]
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }
    let home = dirs::home_dir().expect("Cannot find home directory");
    home.join(".fleetkeeper")
}

/// Get the path to the config file.
pub fn config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Get the path to the persisted fleet state.
pub fn store_path() -> PathBuf {
    get_data_dir().join("fleet.json")
}

/// Ensure the data directory exists.
pub fn ensure_data_dirs() -> Result<()> {
    fs::create_dir_all(get_data_dir()).map_err(|e| AppError::io(e.to_string()))
}

/// Directory holding every instance of a host.
pub fn get_instances_dir(host_base_dir: &Path) -> PathBuf {
    host_base_dir.join("instances")
}

/// Directory of a single instance.
pub fn get_instance_dir(host_base_dir: &Path, instance_id: &str) -> PathBuf {
    get_instances_dir(host_base_dir).join(instance_id)
}

/// Directory holding a host's world save files.
pub fn get_worlds_dir(host_base_dir: &Path) -> PathBuf {
    host_base_dir.join("worlds")
}

/// Live console output of an instance, written by the session's `tee`.
pub fn get_output_file(instance_location: &Path) -> PathBuf {
    instance_location.join("console.out")
}
