//! Local persistence tiers.
//!
//! Each [`StorageBackend`] is an opaque key/value store with its own speed and
//! survivability. None of them is authoritative; the identity store writes the
//! canonical identity key to all of them and repairs the faster tiers from the
//! slower ones.

pub mod file;
pub mod header;
pub mod memory;
pub mod namespace;
pub mod worker;

pub use file::JsonFileStore;
pub use header::HeaderStoreBackend;
pub use memory::MemoryBackend;
pub use namespace::InMemoryNamespace;
pub use worker::{WorkerChannelBackend, WorkerHandle};

use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Persistence tier, ordered from fastest to most clear-resistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Lives as long as the page.
    PageCache,
    /// Lives as long as the tab session.
    SessionCache,
    /// Durable structured local database.
    StructuredDatabase,
    /// Small values with a long expiry, sent along with requests.
    HeaderStore,
    /// Out-of-process background worker reached by request/response.
    BackgroundWorker,
}

impl StorageTier {
    pub const ALL: [StorageTier; 5] = [
        StorageTier::PageCache,
        StorageTier::SessionCache,
        StorageTier::StructuredDatabase,
        StorageTier::HeaderStore,
        StorageTier::BackgroundWorker,
    ];

    /// Lookup priority; lower is consulted first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::PageCache => 0,
            Self::SessionCache => 1,
            Self::StructuredDatabase => 2,
            Self::HeaderStore => 3,
            Self::BackgroundWorker => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageCache => "page_cache",
            Self::SessionCache => "session_cache",
            Self::StructuredDatabase => "structured_database",
            Self::HeaderStore => "header_store",
            Self::BackgroundWorker => "background_worker",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform interface over one persistence tier.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Diagnostic name used in logs and errors.
    fn name(&self) -> &str;

    fn tier(&self) -> StorageTier;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// The enumerable local key/value namespace that holds app data, including
/// legacy-shaped records. Shared between app instances without locking; the
/// last writer wins.
#[async_trait]
pub trait LocalNamespace: Send + Sync {
    async fn keys(&self) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Copies every entry.
    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        for key in self.keys().await? {
            if let Some(value) = self.get(&key).await? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }

    /// Makes the namespace equal to `snapshot`: extra keys are removed and
    /// every captured entry is written back.
    async fn restore(&self, snapshot: &BTreeMap<String, String>) -> Result<()> {
        for key in self.keys().await? {
            if !snapshot.contains_key(&key) {
                self.remove(&key).await?;
            }
        }
        for (key, value) in snapshot {
            self.set(key, value).await?;
        }
        Ok(())
    }
}
