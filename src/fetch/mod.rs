//! Physical fetch attempts.
//!
//! An executor performs exactly one retrieval with a fully resolved method,
//! proxy and user agent, and reports a tagged [`AttemptOutcome`]. Retry,
//! rotation and escalation decisions belong to the engine.

pub mod browser;
pub mod http;
pub mod profile;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::modules::proxy::ProxyEndpoint;
use crate::policy::FetchMethod;

pub use browser::BrowserFetcher;
pub use http::HttpFetcher;
pub use profile::{LaunchProfile, LaunchProfileProvider, StealthProfile};

/// Transport-level failure of a single attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy authentication failed")]
    ProxyAuth,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),
    #[error("browser navigation failed: {0}")]
    Navigation(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// What one executor call produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFetchOutcome {
    pub content: String,
    /// `None` for browser renders.
    pub status: Option<u16>,
    /// Only populated by browser renders.
    pub title: Option<String>,
    pub final_url: Option<String>,
}

/// Tagged result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Fetched(RawFetchOutcome),
    /// Worth another attempt on a fresh proxy.
    Retryable(FetchError),
    /// No point trying again.
    Fatal(FetchError),
}

impl AttemptOutcome {
    pub fn fetched(&self) -> Option<&RawFetchOutcome> {
        match self {
            AttemptOutcome::Fetched(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            AttemptOutcome::Fetched(_) => None,
            AttemptOutcome::Retryable(err) | AttemptOutcome::Fatal(err) => Some(err),
        }
    }
}

/// Fully resolved inputs of one attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub proxy: Option<ProxyEndpoint>,
    pub user_agent: String,
    pub block_resources: bool,
}

/// Performs one physical fetch.
#[async_trait]
pub trait FetchExecutor: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> AttemptOutcome;
}

/// Dispatches to the HTTP client or the headless browser by method.
pub struct DefaultExecutor {
    http: HttpFetcher,
    browser: BrowserFetcher,
}

impl DefaultExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_profile(config, Arc::new(StealthProfile::default()))
    }

    pub fn with_profile(config: &EngineConfig, profile: Arc<dyn LaunchProfileProvider>) -> Self {
        Self {
            http: HttpFetcher::new(config.http_timeout()),
            browser: BrowserFetcher::new(config, profile),
        }
    }
}

#[async_trait]
impl FetchExecutor for DefaultExecutor {
    async fn fetch(&self, request: &FetchRequest) -> AttemptOutcome {
        match request.method {
            FetchMethod::Http => self.http.fetch(request).await,
            FetchMethod::Browser => self.browser.fetch(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let fetched = AttemptOutcome::Fetched(RawFetchOutcome {
            content: "<html></html>".into(),
            status: Some(200),
            ..Default::default()
        });
        assert_eq!(fetched.fetched().and_then(|raw| raw.status), Some(200));
        assert!(fetched.error().is_none());

        let failed = AttemptOutcome::Retryable(FetchError::ProxyAuth);
        assert_eq!(failed.error(), Some(&FetchError::ProxyAuth));
        assert!(failed.fetched().is_none());
    }
}
