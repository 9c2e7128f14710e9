//! Client configuration management.
//!
//! Settings are layered: built-in defaults, then the JSON file at
//! `~/.config/saltline/config.json`, then `SALTAPI_*` environment variables.
//! Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{Error, Result};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "saltline";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_URL: &str = "https://localhost:8000";
const DEFAULT_EAUTH: &str = "auto";

/// HTTP request timeout in seconds for ordinary calls.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub eauth: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Echo wire-level request/response metadata
    pub debug: bool,
    pub timeout_secs: u64,
    pub token_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            username: None,
            password: None,
            eauth: DEFAULT_EAUTH.to_string(),
            insecure: false,
            debug: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            token_file: None,
        }
    }
}

impl ClientConfig {
    /// Defaults, overlaid with the user's config file and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) => Self::load_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply `SALTAPI_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SALTAPI_URL") {
            self.url = url;
        }
        if let Some(user) = lookup("SALTAPI_USER") {
            self.username = Some(user);
        }
        if let Some(pass) = lookup("SALTAPI_PASS") {
            self.password = Some(pass);
        }
        if let Some(eauth) = lookup("SALTAPI_EAUTH") {
            self.eauth = eauth;
        }
        if let Some(insecure) = lookup("SALTAPI_INSECURE") {
            self.insecure = matches!(
                insecure.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
