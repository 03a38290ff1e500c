use super::{BatchOp, Document, Fields, RemoteDataGateway};
use crate::core::{IdentityError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

/// An in-memory implementation of [`RemoteDataGateway`].
///
/// Simulates connectivity loss, permission failures, invisible writes and a
/// failing batch, and records every call so tests can assert on call order.
#[derive(Default)]
pub struct InMemoryGateway {
    collections: RwLock<Collections>,
    offline: AtomicBool,
    deny_writes: AtomicBool,
    hide_writes: AtomicBool,
    fail_batch_at: StdMutex<Option<usize>>,
    latency_ms: AtomicU64,
    upserts: AtomicUsize,
    queries: AtomicUsize,
    deletes: AtomicUsize,
    batches: AtomicUsize,
    batch_ops: AtomicUsize,
    calls: StdMutex<Vec<String>>,
}

impl InMemoryGateway {
    /// Creates a new, empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a gateway from a JSON dump written by [`InMemoryGateway::save_json`].
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let gateway = Self::new();
        let path = path.as_ref();
        if path.exists() {
            let raw = tokio::fs::read_to_string(path).await?;
            if !raw.trim().is_empty() {
                let collections: Collections = serde_json::from_str(&raw)?;
                *gateway.collections.write().await = collections;
            }
        }
        Ok(gateway)
    }

    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let collections = self.collections.read().await;
        let serialized = serde_json::to_string_pretty(&*collections)?;
        tokio::fs::write(path.as_ref(), serialized).await?;
        Ok(())
    }

    /// Seeds a document without counting it as a call.
    pub async fn seed(&self, collection: &str, id: &str, fields: Fields) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Fields> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub async fn collection_len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// Writes are acknowledged but never become visible to queries.
    pub fn set_hide_writes(&self, hide: bool) {
        self.hide_writes.store(hide, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the `n`-th batch write (1-based, counted from now on) fail.
    pub fn fail_batch_at(&self, n: usize) {
        let already = self.batches.load(Ordering::SeqCst);
        if let Ok(mut slot) = self.fail_batch_at.lock() {
            *slot = Some(already + n);
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Every mutating call, with batch operations counted one by one.
    pub fn writes(&self) -> usize {
        self.upserts() + self.deletes() + self.batch_ops.load(Ordering::SeqCst)
    }

    /// Call log in arrival order, e.g. `query:saved_items`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    async fn simulate_latency(&self) {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IdentityError::RemoteUnavailable(
                "remote store unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_online()?;
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(IdentityError::RemotePermissionDenied(
                "write rejected by security rules".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(collections: &mut Collections, op: BatchOp) {
        match op {
            BatchOp::Upsert {
                collection,
                id,
                fields,
            } => {
                let doc = collections
                    .entry(collection)
                    .or_default()
                    .entry(id)
                    .or_default();
                for (key, value) in fields {
                    doc.insert(key, value);
                }
            }
            BatchOp::Delete { collection, id } => {
                if let Some(docs) = collections.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl RemoteDataGateway for InMemoryGateway {
    async fn upsert(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.record(format!("upsert:{}", collection));
        self.simulate_latency().await;
        self.check_writable()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.hide_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut collections = self.collections.write().await;
        Self::apply(
            &mut collections,
            BatchOp::Upsert {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
            },
        );
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.record(format!("query:{}", collection));
        self.simulate_latency().await;
        self.check_online()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, fields)| fields.get(field) == Some(value))
            .take(limit)
            .map(|(id, fields)| Document {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.record(format!("delete:{}", collection));
        self.simulate_latency().await;
        self.check_writable()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().await;
        Self::apply(
            &mut collections,
            BatchOp::Delete {
                collection: collection.to_string(),
                id: id.to_string(),
            },
        );
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.record(format!("batch:{}", ops.len()));
        self.simulate_latency().await;
        self.check_writable()?;
        let batch_no = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        let should_fail = self
            .fail_batch_at
            .lock()
            .map(|slot| *slot == Some(batch_no))
            .unwrap_or(false);
        if should_fail {
            return Err(IdentityError::Remote(format!(
                "batch {} aborted by the remote store",
                batch_no
            )));
        }

        self.batch_ops.fetch_add(ops.len(), Ordering::SeqCst);
        if self.hide_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut collections = self.collections.write().await;
        for op in ops {
            Self::apply(&mut collections, op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_upsert_merges_and_query_filters() {
        let gateway = InMemoryGateway::new();
        gateway
            .upsert("saved_items", "u1_a", fields(json!({"userId": "u1", "title": "A"})))
            .await
            .unwrap();
        gateway
            .upsert("saved_items", "u1_a", fields(json!({"rating": 5})))
            .await
            .unwrap();
        gateway
            .upsert("saved_items", "u2_b", fields(json!({"userId": "u2"})))
            .await
            .unwrap();

        let docs = gateway
            .query("saved_items", "userId", &json!("u1"), 10)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].field_str("title"), Some("A"));
        assert_eq!(docs[0].fields.get("rating"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_offline_and_denied() {
        let gateway = InMemoryGateway::new();
        gateway.set_offline(true);
        assert!(matches!(
            gateway.query("c", "f", &json!("v"), 1).await,
            Err(IdentityError::RemoteUnavailable(_))
        ));
        gateway.set_offline(false);
        gateway.set_deny_writes(true);
        assert!(matches!(
            gateway.delete("c", "id").await,
            Err(IdentityError::RemotePermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_batch_applies_nothing() {
        let gateway = InMemoryGateway::new();
        gateway.fail_batch_at(1);
        let ops = vec![BatchOp::Upsert {
            collection: "c".into(),
            id: "1".into(),
            fields: Fields::new(),
        }];
        assert!(gateway.batch_write(ops.clone()).await.is_err());
        assert_eq!(gateway.collection_len("c").await, 0);
        gateway.batch_write(ops).await.unwrap();
        assert_eq!(gateway.collection_len("c").await, 1);
    }
}
