use super::{StorageBackend, StorageTier};
use crate::core::{IdentityError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// In-process key/value tier.
///
/// Serves the page-lifetime and tab-session caches. Counts reads and writes and
/// can be told to fail, which the tests use to simulate blocked storage.
pub struct MemoryBackend {
    name: String,
    tier: StorageTier,
    entries: RwLock<HashMap<String, String>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, tier: StorageTier) -> Self {
        Self {
            name: name.into(),
            tier,
            entries: RwLock::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: None,
        }
    }

    pub fn page_cache() -> Self {
        Self::new("page_cache", StorageTier::PageCache)
    }

    pub fn session_cache() -> Self {
        Self::new("session_cache", StorageTier::SessionCache)
    }

    /// Suspends every call for `delay` before serving it.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Reads a value without touching the counters.
    pub async fn peek(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::storage(&self.name, "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StorageTier {
        self.tier
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.before_call().await?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}
