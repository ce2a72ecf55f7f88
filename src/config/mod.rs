//! Engine configuration.
//!
//! Provides:
//! - JSON file loading
//! - Environment overrides (proxy credentials, timeouts, `PROXY_ENABLED`)
//! - Compiled-in defaults for everything

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Browser-like user agent sent when no policy overrides it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Credentials of the upstream proxy gateway.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyCredentials {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for ProxyCredentials {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ProxyCredentials {
    /// Every field must be present and non-blank.
    pub fn is_complete(&self) -> bool {
        let missing = [
            ("host", self.host.trim().is_empty()),
            ("port", self.port == 0),
            ("username", self.username.trim().is_empty()),
            ("password", self.password.trim().is_empty()),
        ]
        .into_iter()
        .find(|(_, missing)| *missing);

        match missing {
            Some((field, _)) => {
                log::warn!("proxy credentials incomplete: missing {field}");
                false
            }
            None => true,
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &mask(&self.username))
            .field("password", &mask(&self.password))
            .finish()
    }
}

fn mask(value: &str) -> &'static str {
    if value.is_empty() { "" } else { "***" }
}

/// Process-level settings that do not live in the persisted settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub http_timeout_ms: u64,
    pub browser_timeout_ms: u64,
    /// Wait after navigation so dynamic content can settle.
    pub browser_settle_ms: u64,
    pub settings_ttl_secs: u64,
    pub default_user_agent: String,
    pub proxy: Option<ProxyCredentials>,
    /// Overrides the persisted `proxy_enabled` flag when set.
    pub proxy_enabled_override: Option<bool>,
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 30_000,
            browser_timeout_ms: 20_000,
            browser_settle_ms: 500,
            settings_ttl_secs: 60,
            default_user_agent: DEFAULT_USER_AGENT.into(),
            proxy: None,
            proxy_enabled_override: None,
            chrome_executable: None,
            headless: true,
        }
    }
}

impl EngineConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// File values, then environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_json_file(path)?;
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a key lookup (the process environment in practice).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SMARTPROXY_HOST");
        let port = lookup("SMARTPROXY_PORT");
        let username = lookup("SMARTPROXY_USERNAME");
        let password = lookup("SMARTPROXY_PASSWORD");

        if host.is_some() || port.is_some() || username.is_some() || password.is_some() {
            let mut proxy = self.proxy.clone().unwrap_or_default();
            if let Some(host) = host {
                proxy.host = host;
            }
            if let Some(port) = port {
                proxy.port = parse_env("SMARTPROXY_PORT", &port)?;
            }
            if let Some(username) = username {
                proxy.username = username;
            }
            if let Some(password) = password {
                proxy.password = password;
            }
            self.proxy = Some(proxy);
        }

        if let Some(raw) = lookup("PROXY_ENABLED") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.proxy_enabled_override = Some(true),
                "0" | "false" | "no" | "off" => self.proxy_enabled_override = Some(false),
                _ => log::warn!("ignoring unrecognised PROXY_ENABLED value {raw:?}"),
            }
        }

        if let Some(raw) = lookup("DEFAULT_TIMEOUT") {
            let secs: f64 = parse_env("DEFAULT_TIMEOUT", &raw)?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::InvalidEnv {
                    key: "DEFAULT_TIMEOUT",
                    value: raw,
                });
            }
            self.http_timeout_ms = (secs * 1000.0) as u64;
        }

        if let Some(raw) = lookup("BROWSER_TIMEOUT").or_else(|| lookup("PLAYWRIGHT_TIMEOUT")) {
            self.browser_timeout_ms = parse_env("BROWSER_TIMEOUT", &raw)?;
        }

        if let Some(path) = lookup("CHROME_EXECUTABLE") {
            self.chrome_executable = Some(PathBuf::from(path));
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_timeout_ms)
    }

    pub fn browser_settle(&self) -> Duration {
        Duration::from_millis(self.browser_settle_ms)
    }

    pub fn settings_ttl(&self) -> Duration {
        Duration::from_secs(self.settings_ttl_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
