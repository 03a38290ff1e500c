use super::{StorageBackend, StorageTier};
use crate::core::{Clock, IdentityError, Result, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Largest `name=value` pair the store accepts, in bytes.
pub const MAX_ENTRY_BYTES: usize = 4096;

/// Default lifetime of an entry.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 400;

#[derive(Debug, Clone)]
struct HeaderEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Small-value tier with long expiry, modelled on request-header cookies.
///
/// Entries larger than [`MAX_ENTRY_BYTES`] or containing separator characters
/// are rejected; expired entries read as absent.
pub struct HeaderStoreBackend {
    entries: RwLock<BTreeMap<String, HeaderEntry>>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl HeaderStoreBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
            clock,
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Renders the live entries the way they would travel in a request header.
    pub async fn header_value(&self) -> String {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| format!("{}={}", key, entry.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    fn validate(key: &str, value: &str) -> Result<()> {
        if key.len() + 1 + value.len() > MAX_ENTRY_BYTES {
            return Err(IdentityError::storage(
                "header_store",
                format!("entry '{}' exceeds {} bytes", key, MAX_ENTRY_BYTES),
            ));
        }
        let forbidden = |c: char| c == ';' || c == ',' || c == '=' || c.is_whitespace() || c.is_control();
        if key.is_empty() || key.contains(forbidden) {
            return Err(IdentityError::storage(
                "header_store",
                format!("invalid entry name '{}'", key),
            ));
        }
        if value.contains(|c: char| c == ';' || c == ',' || c.is_whitespace() || c.is_control()) {
            return Err(IdentityError::storage(
                "header_store",
                format!("value for '{}' contains separator characters", key),
            ));
        }
        Ok(())
    }
}

impl Default for HeaderStoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for HeaderStoreBackend {
    fn name(&self) -> &str {
        "header_store"
    }

    fn tier(&self) -> StorageTier {
        StorageTier::HeaderStore
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        Self::validate(key, value)?;
        let expires_at = self.clock.now() + self.max_age;
        self.entries.write().await.insert(
            key.to_string(),
            HeaderEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
