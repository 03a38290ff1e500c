use device_identity::storage::WorkerHandle;
use device_identity::{
    FingerprintGenerator, HeaderStoreBackend, IdentityConfig, IdentityStore, JsonFileStore,
    MemoryBackend, OriginMethod, StaticSignalCollector, StorageBackend, StorageTier, SystemClock,
    WorkerChannelBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

const IDENTITY_KEY: &str = "device_user_id";

struct Tiers {
    page: Arc<MemoryBackend>,
    session: Arc<MemoryBackend>,
    database: Arc<JsonFileStore>,
    header: Arc<HeaderStoreBackend>,
    worker: Arc<WorkerChannelBackend>,
    _worker_handle: WorkerHandle,
    _dir: TempDir,
}

impl Tiers {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let (worker, worker_handle) = WorkerChannelBackend::spawn(Duration::from_millis(200));
        Self {
            page: Arc::new(MemoryBackend::page_cache()),
            session: Arc::new(MemoryBackend::session_cache()),
            database: Arc::new(JsonFileStore::open(dir.path().join("database.json")).unwrap()),
            header: Arc::new(HeaderStoreBackend::new()),
            worker: Arc::new(worker),
            _worker_handle: worker_handle,
            _dir: dir,
        }
    }

    fn all(&self) -> Vec<Arc<dyn StorageBackend>> {
        vec![
            self.page.clone(),
            self.session.clone(),
            self.database.clone(),
            self.header.clone(),
            self.worker.clone(),
        ]
    }
}

fn store(backends: Vec<Arc<dyn StorageBackend>>, collector: Arc<StaticSignalCollector>) -> IdentityStore {
    IdentityStore::new(
        backends,
        Arc::new(FingerprintGenerator::new(collector)),
        &IdentityConfig::default(),
        Arc::new(SystemClock),
    )
}

async fn stored_id(backend: &dyn StorageBackend) -> Option<String> {
    backend.get(IDENTITY_KEY).await.unwrap()
}

#[tokio::test]
async fn test_first_load_generates_and_persists_everywhere() {
    let tiers = Tiers::new();
    let store = store(tiers.all(), Arc::new(StaticSignalCollector::desktop()));

    let identity = store.resolve().await;
    assert_eq!(identity.origin_method, OriginMethod::Generated);
    assert!(identity.persistent);
    assert!(identity.id.starts_with("fp_"));

    for backend in tiers.all() {
        assert_eq!(
            stored_id(backend.as_ref()).await.as_deref(),
            Some(identity.id.as_str()),
            "{} missing the identity",
            backend.name()
        );
    }
    assert_eq!(store.minted_id().await, Some(identity.id.clone()));
    assert!(!store.previous_visit());
}

#[tokio::test]
async fn test_durable_database_survivor_repairs_faster_tiers() {
    let tiers = Tiers::new();
    tiers.database.set(IDENTITY_KEY, "id_42").await.unwrap();
    let store = store(tiers.all(), Arc::new(StaticSignalCollector::desktop()));

    let identity = store.resolve().await;
    assert_eq!(identity.id, "id_42");
    assert_eq!(identity.origin_method, OriginMethod::RecoveredStorage);
    assert_eq!(tiers.page.peek(IDENTITY_KEY).await, Some("id_42".to_string()));
    assert_eq!(tiers.session.peek(IDENTITY_KEY).await, Some("id_42".to_string()));
    // Slower tiers are left alone.
    assert_eq!(stored_id(tiers.header.as_ref()).await, None);
    assert_eq!(stored_id(tiers.worker.as_ref()).await, None);
    assert!(store.previous_visit());
}

#[tokio::test]
async fn test_concurrent_resolution_runs_once() {
    let page = Arc::new(MemoryBackend::page_cache());
    let collector = Arc::new(StaticSignalCollector::desktop().with_delay(Duration::from_millis(20)));
    let store = Arc::new(store(vec![page.clone()], collector.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.resolve().await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.fingerprint().computations(), 1);
    assert_eq!(collector.calls(), 7);
    // One identity lookup plus one breadcrumb probe.
    assert_eq!(page.reads(), 2);
}

#[tokio::test]
async fn test_persisted_identity_survives_clearing_all_but_one_tier() {
    let tiers = Tiers::new();
    let collector = Arc::new(StaticSignalCollector::desktop());
    let first = store(tiers.all(), collector.clone());
    let identity = first.resolve().await;

    tiers.page.clear().await;
    tiers.session.clear().await;
    tiers.header.clear().await;
    tiers.database.remove(IDENTITY_KEY).await.unwrap();

    let reloaded = store(tiers.all(), collector);
    let recovered = reloaded.resolve().await;
    assert_eq!(recovered.id, identity.id);
    assert_eq!(
        recovered.created_at.timestamp_millis(),
        identity.created_at.timestamp_millis()
    );
    for tier in [tiers.page.as_ref(), tiers.session.as_ref()] {
        assert_eq!(tier.peek(IDENTITY_KEY).await, Some(identity.id.clone()));
    }
    assert_eq!(stored_id(tiers.database.as_ref()).await, Some(identity.id.clone()));
    assert_eq!(stored_id(tiers.header.as_ref()).await, Some(identity.id));
}

#[tokio::test]
async fn test_single_backend_failure_does_not_block_others() {
    let page = Arc::new(MemoryBackend::page_cache());
    let session = Arc::new(MemoryBackend::session_cache());
    session.set_failing(true);
    let store = store(vec![page.clone(), session.clone()], Arc::new(StaticSignalCollector::desktop()));

    let identity = store.resolve().await;
    assert!(identity.persistent);
    assert_eq!(page.peek(IDENTITY_KEY).await, Some(identity.id));
}

#[tokio::test]
async fn test_total_persist_failure_degrades_to_session_only() {
    let page = Arc::new(MemoryBackend::page_cache());
    let session = Arc::new(MemoryBackend::session_cache());
    page.set_failing(true);
    session.set_failing(true);
    let store = store(vec![page, session], Arc::new(StaticSignalCollector::desktop()));

    let identity = store.resolve().await;
    assert!(!identity.persistent);
    assert_eq!(identity.origin_method, OriginMethod::Generated);
    assert_eq!(store.resolve().await, identity);

    let report = store.persist(&identity).await;
    assert!(matches!(report, Err(device_identity::IdentityError::IdentityUnavailable)));
}

#[tokio::test]
async fn test_unresponsive_worker_is_skipped() {
    let page = Arc::new(MemoryBackend::page_cache());
    let worker: Arc<dyn StorageBackend> =
        Arc::new(WorkerChannelBackend::unresponsive(Duration::from_millis(30)));
    let store = store(vec![worker.clone(), page.clone()], Arc::new(StaticSignalCollector::desktop()));

    let identity = store.resolve().await;
    assert!(identity.persistent);
    assert_eq!(page.peek(IDENTITY_KEY).await, Some(identity.id));
    assert_eq!(store.backends()[0].tier(), StorageTier::PageCache);
}
