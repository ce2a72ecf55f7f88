//! Domain policies and their resolution.
//!
//! A policy is keyed by the normalized hostname of the target. Unknown domains
//! resolve to a default policy that is handed back to the caller without being
//! persisted.

pub mod settings;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::{PolicyStore, StoreError};

/// Concrete retrieval method for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMethod {
    Http,
    Browser,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Http => "http",
            FetchMethod::Browser => "browser",
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method preference as stored in policies and settings. `Auto` defers to the
/// next tier of the precedence chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodPreference {
    #[default]
    Auto,
    Http,
    Browser,
}

impl MethodPreference {
    pub fn resolved(&self) -> Option<FetchMethod> {
        match self {
            MethodPreference::Auto => None,
            MethodPreference::Http => Some(FetchMethod::Http),
            MethodPreference::Browser => Some(FetchMethod::Browser),
        }
    }
}

impl From<FetchMethod> for MethodPreference {
    fn from(method: FetchMethod) -> Self {
        match method {
            FetchMethod::Http => MethodPreference::Http,
            FetchMethod::Browser => MethodPreference::Browser,
        }
    }
}

pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Per-domain fetch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainPolicy {
    pub domain: String,
    pub enabled: bool,
    pub method: MethodPreference,
    pub use_proxy: bool,
    pub request_delay_ms: u64,
    pub max_concurrency: usize,
    pub user_agent: Option<String>,
    pub block_resources: bool,
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self {
            domain: String::new(),
            enabled: true,
            method: MethodPreference::Auto,
            use_proxy: false,
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            user_agent: None,
            block_resources: true,
        }
    }
}

impl DomainPolicy {
    /// Default policy for `domain`, normalizing the name.
    pub fn for_domain(domain: &str) -> Self {
        Self {
            domain: normalize_domain(domain),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: MethodPreference) -> Self {
        self.method = method;
        self
    }

    pub fn with_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.request_delay_ms = delay_ms;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_block_resources(mut self, block: bool) -> Self {
        self.block_resources = block;
        self
    }

    /// Capacity used by the concurrency gate; never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Partial edit applied through the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainPolicyUpdate {
    pub enabled: Option<bool>,
    pub method: Option<MethodPreference>,
    pub use_proxy: Option<bool>,
    pub request_delay_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub user_agent: Option<String>,
    pub block_resources: Option<bool>,
}

impl DomainPolicyUpdate {
    pub fn apply(&self, policy: &mut DomainPolicy) {
        if let Some(enabled) = self.enabled {
            policy.enabled = enabled;
        }
        if let Some(method) = self.method {
            policy.method = method;
        }
        if let Some(use_proxy) = self.use_proxy {
            policy.use_proxy = use_proxy;
        }
        if let Some(delay) = self.request_delay_ms {
            policy.request_delay_ms = delay;
        }
        if let Some(max) = self.max_concurrency {
            policy.max_concurrency = max.max(1);
        }
        if let Some(ref user_agent) = self.user_agent {
            policy.user_agent = Some(user_agent.clone());
        }
        if let Some(block) = self.block_resources {
            policy.block_resources = block;
        }
    }
}

/// Where a resolved policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Stored,
    Default,
}

/// Policy handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub policy: DomainPolicy,
    pub source: PolicySource,
}

impl ResolvedPolicy {
    /// The stored policy if it is enabled; otherwise defaults for the domain.
    /// Disabled policies never override anything.
    pub fn effective(&self) -> DomainPolicy {
        if self.policy.enabled {
            self.policy.clone()
        } else {
            DomainPolicy::for_domain(&self.policy.domain)
        }
    }

    /// True only for a stored, enabled policy with `use_proxy = false`.
    pub fn forbids_proxy(&self) -> bool {
        self.source == PolicySource::Stored && self.policy.enabled && !self.policy.use_proxy
    }
}

/// Accepts a URL or a bare domain and returns the lowercase host without
/// scheme, port or path.
pub fn normalize_domain(value: &str) -> String {
    let candidate = value.trim().to_lowercase();
    let parsed = if candidate.contains("://") {
        Url::parse(&candidate)
    } else {
        Url::parse(&format!("https://{candidate}"))
    };

    parsed
        .ok()
        .and_then(|url| url.host_str().map(|host| host.trim_matches(['[', ']']).to_string()))
        .filter(|host| !host.is_empty())
        .unwrap_or(candidate)
}

/// Looks up policies by normalized hostname.
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, hostname: &str) -> Result<ResolvedPolicy, StoreError> {
        let domain = normalize_domain(hostname);
        match self.store.get(&domain).await? {
            Some(policy) => Ok(ResolvedPolicy {
                policy,
                source: PolicySource::Stored,
            }),
            None => {
                log::debug!("no policy for {domain}, using defaults");
                Ok(ResolvedPolicy {
                    policy: DomainPolicy::for_domain(&domain),
                    source: PolicySource::Default,
                })
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }
}
