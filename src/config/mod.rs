//! Process settings
//!
//! Where the store lives, which OAuth client to present to the hub, and
//! connection tuning. Everything the user edits (hub URL, auth method, module
//! settings) lives in the persistent store instead, see [`crate::model`].

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::{RetryPolicy, DEFAULT_WATCHDOG};
use crate::store::DEFAULT_KEY_PREFIX;

const APP_DIR_NAME: &str = "pantry-hub-bridge";

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Store file; relative paths resolve against the data directory
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Hub URL to seed when none is stored yet
    #[serde(default)]
    pub hub_url: Option<String>,

    #[serde(default)]
    pub oauth: OAuthSettings,

    #[serde(default)]
    pub connection: ConnectionTuning,
}

fn default_store_file() -> PathBuf {
    PathBuf::from("store.json")
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

#[derive(Debug, Deserialize)]
pub struct OAuthSettings {
    /// Hub OAuth clients are identified by a URL
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

fn default_client_id() -> String {
    "http://localhost:8765/".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8765/?auth_callback=1".to_string()
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectionTuning {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_watchdog_secs() -> u64 {
    DEFAULT_WATCHDOG.as_secs()
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_retries: default_max_retries(),
            watchdog_secs: default_watchdog_secs(),
        }
    }
}

impl ConnectionTuning {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

impl Settings {
    /// Absolute path of the store file
    pub fn store_path(&self) -> PathBuf {
        if self.store_file.is_absolute() {
            self.store_file.clone()
        } else {
            get_data_dir().join(&self.store_file)
        }
    }
}

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PHB_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

/// Get data directory (XDG_DATA_HOME or platform default)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PHB_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from("./data")
}

pub fn load_settings() -> Result<Settings> {
    let config_dir = get_config_dir();

    let settings = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (PHB_KEY_PREFIX, PHB_OAUTH__CLIENT_ID, etc.)
        .add_source(
            ::config::Environment::with_prefix("PHB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
