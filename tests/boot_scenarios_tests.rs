use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use device_identity::migration::MigrationOutcome;
use device_identity::recovery::RecordingPresenter;
use device_identity::storage::WorkerHandle;
use device_identity::{
    HeaderStoreBackend, IdentityConfig, IdentitySubsystem, InMemoryGateway, InMemoryNamespace,
    JsonFileStore, LocalNamespace, ManualClock, MemoryBackend, OriginMethod, RecoveryState,
    RemoteDataGateway, RetryPolicy, StaticSignalCollector, StorageBackend, ValidationLevel,
    WorkerChannelBackend, spawn_loss_monitor,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Device {
    subsystem: Arc<IdentitySubsystem>,
    backends: Vec<Arc<dyn StorageBackend>>,
    presenter: Arc<RecordingPresenter>,
    _worker: WorkerHandle,
}

fn config() -> IdentityConfig {
    IdentityConfig::default()
        .retry(RetryPolicy::no_retry())
        .validation_timeout(Duration::from_millis(50))
}

/// One app load: fresh in-process caches over whatever survives on disk.
fn boot_device(
    dir: &Path,
    gateway: Arc<InMemoryGateway>,
    namespace: Arc<InMemoryNamespace>,
    clock: Arc<ManualClock>,
) -> Device {
    let (worker, worker_handle) = WorkerChannelBackend::spawn(Duration::from_millis(200));
    let backends: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(MemoryBackend::page_cache()),
        Arc::new(MemoryBackend::session_cache()),
        Arc::new(JsonFileStore::open(dir.join("database.json")).unwrap()),
        Arc::new(HeaderStoreBackend::with_clock(clock.clone())),
        Arc::new(worker),
    ];
    let presenter = Arc::new(RecordingPresenter::new());
    let subsystem = IdentitySubsystem::builder()
        .config(config())
        .backends(backends.clone())
        .gateway(gateway)
        .namespace(namespace)
        .signal_collector(Arc::new(StaticSignalCollector::desktop()))
        .presenter(presenter.clone())
        .clock(clock)
        .build()
        .unwrap();
    Device {
        subsystem: Arc::new(subsystem),
        backends,
        presenter,
        _worker: worker_handle,
    }
}

fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 10, 18, 30, 0).unwrap()))
}

#[tokio::test]
async fn test_first_visit_generates_identity_in_every_tier() {
    let dir = tempdir().unwrap();
    let device = boot_device(
        dir.path(),
        Arc::new(InMemoryGateway::new()),
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );

    let boot = device.subsystem.ready().await;

    assert_eq!(boot.identity.origin_method, OriginMethod::Generated);
    assert_eq!(boot.migration, MigrationOutcome::NotNeeded);
    for backend in &device.backends {
        assert_eq!(
            backend.get("device_user_id").await.unwrap(),
            Some(boot.identity.id.clone()),
            "{}",
            backend.name()
        );
    }
    assert!(boot.loss.has_data_loss);
    let recovery = boot.recovery.as_ref().unwrap();
    assert_eq!(recovery.state, RecoveryState::Failed);
    let shown = device.presenter.presentations();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].likely_first_visit);
}

#[tokio::test]
async fn test_returning_visitor_boots_without_recovery() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let namespace = Arc::new(InMemoryNamespace::with_entries([
        ("userName", "Mara"),
        ("theme", "dark"),
        ("volume", "0.6"),
    ]));
    let clock = start_clock();

    let first = boot_device(dir.path(), gateway.clone(), namespace.clone(), clock.clone());
    let identity = first.subsystem.identity().await;
    let mut fields = serde_json::Map::new();
    fields.insert("userId".to_string(), json!(identity.id));
    gateway
        .upsert("saved_items", &format!("{}_m1", identity.id), fields)
        .await
        .unwrap();

    clock.advance(ChronoDuration::days(1));
    let second = boot_device(dir.path(), gateway, namespace, clock);
    let boot = second.subsystem.ready().await;

    assert_eq!(boot.identity.id, identity.id);
    assert_eq!(boot.identity.origin_method, OriginMethod::RecoveredStorage);
    assert!(!boot.loss.has_data_loss);
    assert!(boot.loss.breadcrumb_present);
    assert!(boot.recovery.is_none());
    assert_eq!(second.presenter.count(), 0);
}

#[tokio::test]
async fn test_full_clear_recovers_through_fingerprint_verification() {
    let first_dir = tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let first = boot_device(
        first_dir.path(),
        gateway.clone(),
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );
    let original = first.subsystem.identity().await;
    let mut fields = serde_json::Map::new();
    fields.insert("userId".to_string(), json!(original.id));
    gateway
        .upsert("watch_progress", &format!("{}_e7", original.id), fields)
        .await
        .unwrap();

    // Every local tier wiped: a new directory and new caches.
    let cleared_dir = tempdir().unwrap();
    let second = boot_device(
        cleared_dir.path(),
        gateway,
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );
    let boot = second.subsystem.ready().await;

    assert_eq!(boot.identity.id, original.id);
    assert_eq!(boot.identity.origin_method, OriginMethod::RecoveredFingerprintVerified);
    let recovery = boot.recovery.as_ref().unwrap();
    assert!(recovery.succeeded());
    assert_eq!(
        recovery.validation.as_ref().map(|v| v.level),
        Some(ValidationLevel::Full)
    );
    assert_eq!(second.presenter.count(), 0);
}

#[tokio::test]
async fn test_concurrent_consumers_share_one_boot() {
    let dir = tempdir().unwrap();
    let device = boot_device(
        dir.path(),
        Arc::new(InMemoryGateway::new()),
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let subsystem = device.subsystem.clone();
            tokio::spawn(async move { subsystem.identity().await })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(device.presenter.count(), 1);
}

#[tokio::test]
async fn test_legacy_namespace_is_migrated_before_resolution() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let namespace = Arc::new(InMemoryNamespace::with_entries([
        ("userId", "1699999999999_k3j2h1"),
        ("savedItems", r#"[{"id":"m1"},{"id":"m2"}]"#),
        ("theme", "dark"),
        ("volume", "0.6"),
    ]));
    let device = boot_device(dir.path(), gateway.clone(), namespace.clone(), start_clock());

    let boot = device.subsystem.ready().await;

    assert!(matches!(boot.migration, MigrationOutcome::Completed(_)));
    assert_eq!(boot.identity.origin_method, OriginMethod::Migrated);
    assert_eq!(gateway.collection_len("saved_items").await, 2);
    assert!(!boot.loss.indicators.no_saved_items);
    assert!(boot.recovery.is_none());
    assert!(namespace.get("__identity_migration_v2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_loss_monitor_publishes_and_never_overlaps() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let device = boot_device(
        dir.path(),
        gateway.clone(),
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );
    device.subsystem.ready().await;

    let monitor = spawn_loss_monitor(device.subsystem.clone(), Duration::from_millis(20));
    let mut updates = monitor.subscribe();
    tokio::time::timeout(Duration::from_secs(2), updates.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(updates.borrow().is_some());

    gateway.set_latency(Duration::from_millis(50));
    let scan = monitor.scan().clone();
    monitor.stop().await.unwrap();

    let (a, b) = tokio::join!(scan.pass(), scan.pass());
    assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    assert!(!scan.is_running());
    // Recovery stays latched to the boot outcome.
    assert_eq!(device.presenter.count(), 1);
}

#[tokio::test]
async fn test_abandoned_loss_scan_releases_its_slot() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let device = boot_device(
        dir.path(),
        gateway.clone(),
        Arc::new(InMemoryNamespace::new()),
        start_clock(),
    );
    device.subsystem.ready().await;

    let monitor = spawn_loss_monitor(device.subsystem.clone(), Duration::from_secs(3600));
    let scan = monitor.scan().clone();
    monitor.stop().await.unwrap();

    gateway.set_latency(Duration::from_millis(500));
    let abandoned = tokio::time::timeout(Duration::from_millis(50), scan.pass()).await;
    assert!(abandoned.is_err());
    assert!(!scan.is_running());

    gateway.set_latency(Duration::ZERO);
    assert!(scan.pass().await.is_some());
}
