//! Persistent CLI configuration.

use std::path::{Path, PathBuf};

use reps_core::config::{BackendConfig, SyncConfig};
use reps_core::util::normalize_text_option;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "cli-config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub backend: Option<BackendSettings>,
    /// Sync engine tuning, defaults when absent
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendSettings {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("reps")
        .join(CONFIG_FILE_NAME)
}

/// Show the first and last characters of a secret only
pub fn mask_secret(value: &str) -> String {
    let chars = value.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head = chars[..4].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}...{tail}")
}

impl CliConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config
            .sync
            .validate()
            .map_err(|error| format!("Invalid sync settings in {}: {error}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    /// Backend settings from the environment, falling back to the file
    pub fn backend_config(&self) -> Result<Option<BackendConfig>, String> {
        if let Some(config) = BackendConfig::from_env().map_err(|error| error.to_string())? {
            return Ok(Some(config));
        }
        let Some(settings) = self.backend.as_ref() else {
            return Ok(None);
        };
        match (settings.api_url.clone(), settings.api_key.clone()) {
            (Some(api_url), Some(api_key)) => BackendConfig::new(api_url, api_key)
                .map(Some)
                .map_err(|error| error.to_string()),
            _ => Ok(None),
        }
    }

    fn normalize(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.api_url = normalize_text_option(backend.api_url.take())
                .map(|url| url.trim_end_matches('/').to_string());
            backend.api_key = normalize_text_option(backend.api_key.take());
        }
    }
}
