pub mod error;
pub mod features;

pub use error::*;
pub use features::{FEATURE_FLAGS_ENV, FeatureFlags};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATE_STORE_ENV: &str = "KOPS_STATE_STORE";
pub const CONFIG_PATH_ENV: &str = "KOPS_CONFIG_PATH";

/// Contents of `~/.config/kopsflow/config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// The kopsflow config directory (`~/.config/kopsflow`)
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("kopsflow"))
}

/// Find the user config file
///
/// Search order:
/// 1. `KOPS_CONFIG_PATH` (direct path)
/// 2. `~/.config/kopsflow/config.yaml`
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Some(path);
        }
    }

    let global = get_config_dir().ok()?.join("config.yaml");
    global.exists().then_some(global)
}

/// Load the user config, or the default when there is none
pub fn load_user_config() -> Result<UserConfig> {
    match find_config_file() {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            UserConfig::load(&path)
        }
        None => Ok(UserConfig::default()),
    }
}

/// Resolve the registry location
///
/// Priority:
/// 1. the `--state` flag
/// 2. `KOPS_STATE_STORE`
/// 3. `state_store` in the user config file
pub fn resolve_state_store(flag: Option<&str>) -> Result<String> {
    if let Some(flag) = flag.filter(|s| !s.trim().is_empty()) {
        return Ok(flag.trim().to_string());
    }

    if let Ok(env) = std::env::var(STATE_STORE_ENV) {
        if !env.trim().is_empty() {
            return Ok(env.trim().to_string());
        }
    }

    if let Some(store) = load_user_config()?.state_store {
        return Ok(store);
    }

    Err(ConfigError::StateStoreNotSet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        unsafe {
            std::env::remove_var(STATE_STORE_ENV);
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("kopsflow"));
    }

    #[test]
    #[serial]
    fn test_flag_wins() {
        clear_env();
        unsafe {
            std::env::set_var(STATE_STORE_ENV, "s3://from-env");
        }
        let store = resolve_state_store(Some("memfs://from-flag")).unwrap();
        assert_eq!(store, "memfs://from-flag");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_over_config_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "state_store: file:///from-file\n").unwrap();
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
            std::env::set_var(STATE_STORE_ENV, "s3://from-env");
        }

        assert_eq!(resolve_state_store(None).unwrap(), "s3://from-env");

        unsafe {
            std::env::remove_var(STATE_STORE_ENV);
        }
        assert_eq!(resolve_state_store(None).unwrap(), "file:///from-file");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_bad_config_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "state_store: [unterminated\n").unwrap();
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        }
        assert!(matches!(
            resolve_state_store(None),
            Err(ConfigError::Parse { .. })
        ));
        clear_env();
    }
}
