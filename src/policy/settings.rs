//! Global proxy/retry/delay settings and their time-boxed cache.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::MethodPreference;
use crate::storage::SettingsSource;

/// Key under which the settings record is persisted.
pub const SETTINGS_KEY: &str = "proxy_config";

/// Default lifetime of a cached settings copy.
pub const SETTINGS_TTL: Duration = Duration::from_secs(60);

const MAX_STICKY_TTL_SECS: u64 = 3600;
const MAX_RETRY_COUNT: u32 = 10;
const MAX_DELAY_MS: u64 = 60_000;

/// When a sticky proxy endpoint gets replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// One endpoint per job for the whole session TTL.
    #[default]
    PerJob,
    /// Keep the endpoint until an attempt fails, then rotate.
    OnFailure,
    /// Fresh endpoint for every request, nothing stored.
    PerRequest,
}

/// Process-wide proxy, retry and delay configuration.
///
/// Field aliases accept the record layout written by the settings API
/// (`proxy_country`, `proxy_sticky_ttl_sec`, `scrape_method_policy`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub proxy_enabled: bool,
    #[serde(alias = "proxy_provider")]
    pub provider: String,
    pub proxy_type: String,
    #[serde(alias = "proxy_country")]
    pub country: Option<String>,
    #[serde(alias = "proxy_sticky_enabled")]
    pub sticky_enabled: bool,
    #[serde(alias = "proxy_sticky_ttl_sec")]
    pub sticky_ttl_seconds: u64,
    #[serde(alias = "proxy_rotation_strategy")]
    pub rotation_strategy: RotationStrategy,
    #[serde(alias = "proxy_retry_count")]
    pub retry_count: u32,
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,
    #[serde(alias = "scrape_method_policy")]
    pub method_policy: MethodPreference,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            provider: "smartproxy".into(),
            proxy_type: "residential".into(),
            country: Some("us".into()),
            sticky_enabled: false,
            sticky_ttl_seconds: 300,
            rotation_strategy: RotationStrategy::PerJob,
            retry_count: 3,
            request_delay_min_ms: 500,
            request_delay_max_ms: 2000,
            method_policy: MethodPreference::Auto,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("sticky_ttl_seconds must be at most 3600, got {0}")]
    StickyTtl(u64),
    #[error("retry_count must be at most 10, got {0}")]
    RetryCount(u32),
    #[error("request delays must be at most 60000ms, got {0}ms")]
    Delay(u64),
    #[error("request_delay_min_ms ({min}) exceeds request_delay_max_ms ({max})")]
    DelayRange { min: u64, max: u64 },
}

impl ProxySettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.sticky_ttl_seconds > MAX_STICKY_TTL_SECS {
            return Err(SettingsError::StickyTtl(self.sticky_ttl_seconds));
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(SettingsError::RetryCount(self.retry_count));
        }
        for delay in [self.request_delay_min_ms, self.request_delay_max_ms] {
            if delay > MAX_DELAY_MS {
                return Err(SettingsError::Delay(delay));
            }
        }
        if self.request_delay_min_ms > self.request_delay_max_ms {
            return Err(SettingsError::DelayRange {
                min: self.request_delay_min_ms,
                max: self.request_delay_max_ms,
            });
        }
        Ok(())
    }

    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_seconds)
    }

    /// Country code for geo-targeting, ignoring blanks.
    pub fn country_code(&self) -> Option<&str> {
        self.country
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    /// Total number of attempts allowed per invocation.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Partial update written through the settings API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettingsUpdate {
    pub proxy_enabled: Option<bool>,
    pub provider: Option<String>,
    pub proxy_type: Option<String>,
    pub country: Option<String>,
    pub sticky_enabled: Option<bool>,
    pub sticky_ttl_seconds: Option<u64>,
    pub rotation_strategy: Option<RotationStrategy>,
    pub retry_count: Option<u32>,
    pub request_delay_min_ms: Option<u64>,
    pub request_delay_max_ms: Option<u64>,
    pub method_policy: Option<MethodPreference>,
}

impl ProxySettingsUpdate {
    /// Returns the merged settings, rejecting results that fail validation.
    pub fn apply(&self, current: &ProxySettings) -> Result<ProxySettings, SettingsError> {
        let mut next = current.clone();
        if let Some(enabled) = self.proxy_enabled {
            next.proxy_enabled = enabled;
        }
        if let Some(ref provider) = self.provider {
            next.provider = provider.clone();
        }
        if let Some(ref proxy_type) = self.proxy_type {
            next.proxy_type = proxy_type.clone();
        }
        if let Some(ref country) = self.country {
            next.country = Some(country.clone());
        }
        if let Some(sticky) = self.sticky_enabled {
            next.sticky_enabled = sticky;
        }
        if let Some(ttl) = self.sticky_ttl_seconds {
            next.sticky_ttl_seconds = ttl;
        }
        if let Some(strategy) = self.rotation_strategy {
            next.rotation_strategy = strategy;
        }
        if let Some(retries) = self.retry_count {
            next.retry_count = retries;
        }
        if let Some(min) = self.request_delay_min_ms {
            next.request_delay_min_ms = min;
        }
        if let Some(max) = self.request_delay_max_ms {
            next.request_delay_max_ms = max;
        }
        if let Some(method) = self.method_policy {
            next.method_policy = method;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Cached copy of [`ProxySettings`] that reloads after its TTL.
///
/// Concurrent callers may race to reload; the last writer wins.
pub struct SettingsCache {
    source: Arc<dyn SettingsSource>,
    ttl: Duration,
    cached: RwLock<Option<(ProxySettings, Instant)>>,
}

impl SettingsCache {
    pub fn new(source: Arc<dyn SettingsSource>) -> Self {
        Self::with_ttl(source, SETTINGS_TTL)
    }

    pub fn with_ttl(source: Arc<dyn SettingsSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> ProxySettings {
        let stale = {
            let guard = self.cached.read().await;
            match guard.as_ref() {
                Some((settings, loaded_at)) if loaded_at.elapsed() < self.ttl => {
                    return settings.clone();
                }
                Some((settings, _)) => Some(settings.clone()),
                None => None,
            }
        };

        match self.source.load_settings().await {
            Ok(record) => {
                let settings = record.unwrap_or_default();
                log::info!(
                    "proxy settings loaded (enabled={}, provider={}, strategy={:?})",
                    settings.proxy_enabled,
                    settings.provider,
                    settings.rotation_strategy
                );
                *self.cached.write().await = Some((settings.clone(), Instant::now()));
                settings
            }
            Err(err) => {
                log::warn!("failed to load proxy settings: {err}");
                stale.unwrap_or_default()
            }
        }
    }

    /// Drop the cached copy so the next `get` reloads.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
