//! Persistence seams for domain policies and the global settings record.
//!
//! The CRUD layer owns these records; the engine only reads them (and the
//! admin helpers write through [`PolicyStore::upsert`] and
//! [`SettingsSource::save_settings`]).

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::DomainPolicy;
use crate::policy::settings::ProxySettings;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] redb::Error),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("settings source is read-only")]
    ReadOnly,
}

/// Domain policy records keyed by normalized hostname.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<DomainPolicy>, StoreError>;

    /// Insert or replace the policy for `policy.domain` (normalized on write).
    async fn upsert(&self, policy: DomainPolicy) -> Result<DomainPolicy, StoreError>;

    async fn list(&self) -> Result<Vec<DomainPolicy>, StoreError>;
}

/// The single persisted settings record.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load_settings(&self) -> Result<Option<ProxySettings>, StoreError>;

    /// Sources that cannot persist keep this default and reject writes.
    async fn save_settings(&self, _settings: &ProxySettings) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}
