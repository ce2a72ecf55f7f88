//! `redb`-backed persistent store.
//!
//! Policies live in one table keyed by normalized hostname, the settings
//! record in another under [`SETTINGS_KEY`]. Values are JSON documents.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{PolicyStore, SettingsSource, StoreError};
use crate::policy::settings::{ProxySettings, SETTINGS_KEY};
use crate::policy::{DomainPolicy, normalize_domain};

const POLICIES: TableDefinition<&str, &str> = TableDefinition::new("domain_policies");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(redb::Error::from)?;
        Self::from_database(db)
    }

    /// Non-persistent database, mostly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        Self::from_database(db)
    }

    fn from_database(db: Database) -> Result<Self, StoreError> {
        create_tables(&db)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn create_tables(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        txn.open_table(POLICIES)?;
        txn.open_table(SETTINGS)?;
    }
    txn.commit()?;
    Ok(())
}

fn read_value(
    db: &Database,
    table: TableDefinition<'static, &'static str, &'static str>,
    key: &str,
) -> Result<Option<String>, redb::Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(table)?;
    Ok(table.get(key)?.map(|value| value.value().to_string()))
}

fn write_value(
    db: &Database,
    table: TableDefinition<'static, &'static str, &'static str>,
    key: &str,
    value: &str,
) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(table)?;
        table.insert(key, value)?;
    }
    txn.commit()?;
    Ok(())
}

fn read_all(
    db: &Database,
    table: TableDefinition<'static, &'static str, &'static str>,
) -> Result<Vec<String>, redb::Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(table)?;
    let mut values = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        values.push(value.value().to_string());
    }
    Ok(values)
}

#[async_trait]
impl PolicyStore for RedbStore {
    async fn get(&self, domain: &str) -> Result<Option<DomainPolicy>, StoreError> {
        let domain = normalize_domain(domain);
        self.blocking(move |db| match read_value(db, POLICIES, &domain)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        })
        .await
    }

    async fn upsert(&self, mut policy: DomainPolicy) -> Result<DomainPolicy, StoreError> {
        policy.domain = normalize_domain(&policy.domain);
        self.blocking(move |db| {
            let raw = serde_json::to_string(&policy)?;
            write_value(db, POLICIES, &policy.domain, &raw)?;
            Ok(policy)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<DomainPolicy>, StoreError> {
        self.blocking(|db| {
            read_all(db, POLICIES)?
                .iter()
                .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl SettingsSource for RedbStore {
    async fn load_settings(&self) -> Result<Option<ProxySettings>, StoreError> {
        self.blocking(|db| match read_value(db, SETTINGS, SETTINGS_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        })
        .await
    }

    async fn save_settings(&self, settings: &ProxySettings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings)?;
        self.blocking(move |db| {
            write_value(db, SETTINGS, SETTINGS_KEY, &raw)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MethodPreference;
    use crate::policy::settings::RotationStrategy;

    #[tokio::test]
    async fn policies_round_trip_by_normalized_host() {
        let store = RedbStore::in_memory().unwrap();
        assert!(store.get("example.com").await.unwrap().is_none());

        store
            .upsert(
                DomainPolicy::for_domain("https://Example.com/path")
                    .with_method(MethodPreference::Browser)
                    .with_user_agent("Custom/1.0"),
            )
            .await
            .unwrap();

        let policy = store.get("EXAMPLE.COM:443").await.unwrap().unwrap();
        assert_eq!(policy.domain, "example.com");
        assert_eq!(policy.method, MethodPreference::Browser);
        assert_eq!(policy.user_agent.as_deref(), Some("Custom/1.0"));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn settings_record_is_optional() {
        let store = RedbStore::in_memory().unwrap();
        assert!(store.load_settings().await.unwrap().is_none());

        let settings = ProxySettings {
            rotation_strategy: RotationStrategy::PerRequest,
            ..Default::default()
        };
        store.save_settings(&settings).await.unwrap();
        assert_eq!(store.load_settings().await.unwrap(), Some(settings));
    }
}
