//! Tollgate Settings
//!
//! JSON config file management for Tollgate services. A service defines
//! its own config type and wraps it in `Settings<T>` to persist it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write settings: {0}")]
    Write(#[source] io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to create directory {0}: {1}")]
    CreateDir(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings wrapper for any serializable config type.
///
/// ```ignore
/// let settings: Settings<Config> = Settings::load_or_default("tollgate", None)?;
/// ```
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default> Settings<T> {
    /// Load settings from the default path for a service, or create defaults.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(service),
        };

        if path.exists() {
            debug!(path = %path.display(), "loading settings");
            let content = fs::read_to_string(&path).map_err(SettingsError::Read)?;
            let config: T = serde_json::from_str(&content)?;
            Ok(Self { config, path })
        } else {
            debug!(path = %path.display(), "creating default settings");
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            Ok(settings)
        }
    }

    /// Save current settings to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SettingsError::CreateDir(parent.to_path_buf(), e))?;
        }
        let content = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.path, content).map_err(SettingsError::Write)
    }

    /// The path this settings file lives at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Default settings file path for a service: `$XDG_CONFIG_HOME/<service>/settings.json`.
pub fn default_settings_path(service: &str) -> PathBuf {
    config_dir(service).join("settings.json")
}

fn config_dir(service: &str) -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"));
    base.join(service.to_lowercase())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct TestConfig {
        name: String,
        value: u32,
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = std::env::temp_dir().join("tollgate-settings-test-default");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("settings.json");

        let settings: Settings<TestConfig> =
            Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(settings.config, TestConfig::default());
        assert!(path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("tollgate-settings-test-save");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("settings.json");

        let mut settings: Settings<TestConfig> =
            Settings::load_or_default("test", Some(&path)).unwrap();
        settings.config.name = "modified".to_string();
        settings.config.value = 42;
        settings.save().unwrap();

        let loaded: Settings<TestConfig> =
            Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(loaded.config.name, "modified");
        assert_eq!(loaded.config.value, 42);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_parse_error_surfaces() {
        let dir = std::env::temp_dir().join("tollgate-settings-test-parse");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "not json").unwrap();

        let result: Result<Settings<TestConfig>> = Settings::load_or_default("test", Some(&path));
        assert!(matches!(result, Err(SettingsError::Parse(_))));

        let _ = fs::remove_dir_all(&dir);
    }
}
