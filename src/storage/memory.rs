use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{PolicyStore, SettingsSource, StoreError};
use crate::policy::settings::ProxySettings;
use crate::policy::{DomainPolicy, normalize_domain};

/// In-process store for embedders and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    policies: RwLock<BTreeMap<String, DomainPolicy>>,
    settings: RwLock<Option<ProxySettings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies<I>(policies: I) -> Self
    where
        I: IntoIterator<Item = DomainPolicy>,
    {
        let store = Self::new();
        if let Ok(mut guard) = store.policies.write() {
            for mut policy in policies {
                policy.domain = normalize_domain(&policy.domain);
                guard.insert(policy.domain.clone(), policy);
            }
        }
        store
    }

    pub fn with_settings(self, settings: ProxySettings) -> Self {
        if let Ok(mut guard) = self.settings.write() {
            *guard = Some(settings);
        }
        self
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get(&self, domain: &str) -> Result<Option<DomainPolicy>, StoreError> {
        let domain = normalize_domain(domain);
        Ok(self
            .policies
            .read()
            .ok()
            .and_then(|map| map.get(&domain).cloned()))
    }

    async fn upsert(&self, mut policy: DomainPolicy) -> Result<DomainPolicy, StoreError> {
        policy.domain = normalize_domain(&policy.domain);
        if let Ok(mut guard) = self.policies.write() {
            guard.insert(policy.domain.clone(), policy.clone());
        }
        Ok(policy)
    }

    async fn list(&self) -> Result<Vec<DomainPolicy>, StoreError> {
        Ok(self
            .policies
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl SettingsSource for MemoryStore {
    async fn load_settings(&self) -> Result<Option<ProxySettings>, StoreError> {
        Ok(self.settings.read().ok().and_then(|guard| guard.clone()))
    }

    async fn save_settings(&self, settings: &ProxySettings) -> Result<(), StoreError> {
        if let Ok(mut guard) = self.settings.write() {
            *guard = Some(settings.clone());
        }
        Ok(())
    }
}
