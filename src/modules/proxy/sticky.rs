//! Sticky session store.
//!
//! Binds a session key to one proxy endpoint until its deadline. Expired
//! entries are purged lazily whenever the map is consulted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::{ProxyEndpoint, SessionKey};

#[derive(Debug, Clone)]
pub struct StickySession {
    pub endpoint: ProxyEndpoint,
    pub expires_at: Instant,
}

impl StickySession {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe sticky session map.
#[derive(Clone, Debug, Default)]
pub struct StickySessions {
    inner: Arc<RwLock<HashMap<SessionKey, StickySession>>>,
}

impl StickySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live endpoint for `key`, purging expired entries first.
    pub fn lookup(&self, key: &SessionKey) -> Option<ProxyEndpoint> {
        let now = Instant::now();
        let mut guard = self.inner.write().ok()?;
        guard.retain(|_, session| session.is_live(now));
        guard.get(key).map(|session| session.endpoint.clone())
    }

    /// Store `endpoint` under `key`, overwriting any previous binding.
    pub fn store(&self, key: SessionKey, endpoint: ProxyEndpoint, ttl: Duration) {
        if let Ok(mut guard) = self.inner.write() {
            guard.insert(
                key,
                StickySession {
                    endpoint,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn remove(&self, key: &SessionKey) -> bool {
        self.inner
            .write()
            .map(|mut guard| guard.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_all(&self) {
        if let Ok(mut guard) = self.inner.write() {
            guard.clear();
        }
    }
}
