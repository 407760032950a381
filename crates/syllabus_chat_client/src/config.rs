//! Client config load/save for `~/.syllabus-chat/config.yaml`.
//! Sections: api.*, user.*, store.*, chat.*; every field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::DEFAULT_TIMEOUT;
use crate::model::UserIdentity;

/// Chatbot API used when `api.base_url` is absent.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_GUEST_MESSAGE_LIMIT: usize = 2;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// API section (base_url, timeout_secs).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Signed-in user (id, email). No id means guest mode.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UserSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Where conversation documents are kept.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoreSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_message_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub user: UserSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub chat: ChatSection,
}

impl Config {
    pub fn api_base_url(&self) -> &str {
        self.api.base_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    pub fn request_timeout(&self) -> Duration {
        self.api
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn guest_message_limit(&self) -> usize {
        self.chat
            .guest_message_limit
            .unwrap_or(DEFAULT_GUEST_MESSAGE_LIMIT)
    }

    pub fn history_limit(&self) -> usize {
        self.chat.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }

    /// `store.path`, or a `store` directory next to the config file.
    pub fn store_path(&self, config_path: &Path) -> PathBuf {
        match &self.store.path {
            Some(p) => PathBuf::from(p),
            None => config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("store"),
        }
    }

    /// The configured user, or `None` for guest mode.
    pub fn user_identity(&self) -> Option<UserIdentity> {
        let id = self.user.id.as_ref().filter(|id| !id.trim().is_empty())?;
        Some(UserIdentity {
            id: id.clone(),
            email: self.user.email.clone(),
        })
    }
}

/// Returns the default config file path: `~/.syllabus-chat/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".syllabus-chat").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let io_err = |source: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents).map_err(io_err)
}

/// Config load/save error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// The file does not exist (as opposed to being unreadable or invalid).
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
