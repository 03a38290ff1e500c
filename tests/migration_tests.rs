use chrono::{Duration, TimeZone, Utc};
use device_identity::migration::{MigrationBackup, RUN_ID_FIELD};
use device_identity::{
    FingerprintGenerator, IdentityConfig, IdentityStore, InMemoryGateway, InMemoryNamespace,
    LocalNamespace, ManualClock, MemoryBackend, MigrationManager, MigrationOutcome, OriginMethod,
    RetryPolicy, StaticSignalCollector, StorageBackend, StorageTier,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const SAVED_ITEMS: &str = r#"[
    {"id": "m1", "title": "Heat"},
    {"id": "m2", "title": "Ronin"},
    {"id": "m3", "title": "Collateral"}
]"#;
const PROGRESS: &str = r#"{"e1": 0.4, "e2": {"seconds": 1200}}"#;

struct Harness {
    clock: Arc<ManualClock>,
    page: Arc<MemoryBackend>,
    backup: Arc<MemoryBackend>,
    gateway: Arc<InMemoryGateway>,
    namespace: Arc<InMemoryNamespace>,
    manager: MigrationManager,
}

fn legacy_namespace(legacy_id: &str) -> InMemoryNamespace {
    InMemoryNamespace::with_entries([
        ("userId", legacy_id),
        ("savedItems", SAVED_ITEMS),
        ("watchProgress", PROGRESS),
        ("theme", "dark"),
    ])
}

fn harness(namespace: InMemoryNamespace) -> Harness {
    let config = IdentityConfig::default()
        .migration_batch_size(2)
        .retry(RetryPolicy::no_retry());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()));
    let page = Arc::new(MemoryBackend::page_cache());
    let backup = Arc::new(MemoryBackend::new("structured_database", StorageTier::StructuredDatabase));
    let gateway = Arc::new(InMemoryGateway::new());
    let namespace = Arc::new(namespace);
    let store = Arc::new(IdentityStore::new(
        vec![page.clone() as Arc<dyn StorageBackend>],
        Arc::new(FingerprintGenerator::new(Arc::new(StaticSignalCollector::desktop()))),
        &config,
        clock.clone(),
    ));
    let manager = MigrationManager::new(
        store,
        gateway.clone(),
        namespace.clone(),
        backup.clone(),
        &config,
        clock.clone(),
    );
    Harness {
        clock,
        page,
        backup,
        gateway,
        namespace,
        manager,
    }
}

#[tokio::test]
async fn test_legacy_data_moves_to_current_identity() {
    let h = harness(legacy_namespace("1699999999999_k3j2h1"));
    assert!(h.manager.needs_migration().await.unwrap());

    let report = match h.manager.run().await.unwrap() {
        MigrationOutcome::Completed(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };

    assert!(report.identity.id.starts_with("fp_"));
    assert_eq!(report.identity.origin_method, OriginMethod::Migrated);
    assert_eq!(h.page.peek("device_user_id").await, Some(report.identity.id.clone()));
    assert_eq!(report.saved_items_moved, 3);
    assert_eq!(report.progress_moved, 2);
    assert_eq!(report.batches, 3);
    assert_eq!(h.gateway.collection_len("saved_items").await, 3);
    assert_eq!(h.gateway.collection_len("watch_progress").await, 2);

    let doc = h
        .gateway
        .document("saved_items", &format!("{}_m2", report.identity.id))
        .await
        .unwrap();
    assert_eq!(doc.get("userId"), Some(&json!(report.identity.id)));
    assert_eq!(doc.get(RUN_ID_FIELD), Some(&json!(report.run_id)));

    // Deletion is deferred.
    assert!(h.namespace.peek("savedItems").await.is_some());
    assert_eq!(
        report.scheduled_for_deletion,
        vec!["savedItems".to_string(), "userId".to_string(), "watchProgress".to_string()]
    );
    let record = h.manager.record().await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.backup_handle, "structured_database:__identity_migration_backup_v2");
    assert!(!h.manager.needs_migration().await.unwrap());
}

#[tokio::test]
async fn test_second_run_performs_zero_writes() {
    let h = harness(legacy_namespace("legacy-7"));
    assert!(matches!(h.manager.run().await.unwrap(), MigrationOutcome::Completed(_)));

    let namespace_writes = h.namespace.mutations();
    let remote_writes = h.gateway.writes();
    let backup_writes = h.backup.writes();
    let page_writes = h.page.writes();

    let second = h.manager.run().await.unwrap();
    assert!(matches!(second, MigrationOutcome::AlreadyCompleted(_)));
    assert_eq!(h.namespace.mutations(), namespace_writes);
    assert_eq!(h.gateway.writes(), remote_writes);
    assert_eq!(h.backup.writes(), backup_writes);
    assert_eq!(h.page.writes(), page_writes);
}

#[tokio::test]
async fn test_backup_holds_the_untouched_namespace() {
    let h = harness(legacy_namespace("legacy-7"));
    let before = h.namespace.snapshot().await.unwrap();

    h.manager.run().await.unwrap();

    let backup: MigrationBackup = serde_json::from_str(
        &h.backup.peek("__identity_migration_backup_v2").await.unwrap(),
    )
    .unwrap();
    assert_eq!(backup.entries, before);
    assert_eq!(backup.version, 2);
    assert_eq!(h.manager.load_backup().await.unwrap(), Some(backup));
}

#[tokio::test]
async fn test_unwritable_backup_aborts_before_any_mutation() {
    let h = harness(legacy_namespace("legacy-7"));
    h.backup.set_failing(true);

    let outcome = h.manager.run().await.unwrap();

    assert!(matches!(outcome, MigrationOutcome::Aborted { .. }));
    assert_eq!(h.namespace.mutations(), 0);
    assert_eq!(h.gateway.writes(), 0);
    assert_eq!(h.page.writes(), 0);
    assert!(h.manager.needs_migration().await.unwrap());
}

#[tokio::test]
async fn test_failed_batch_rolls_back_local_state() {
    let h = harness(legacy_namespace("legacy-7"));
    let before = h.namespace.snapshot().await.unwrap();
    h.gateway.fail_batch_at(2);

    let outcome = h.manager.run().await.unwrap();

    match outcome {
        MigrationOutcome::RolledBack { restored, .. } => assert!(restored),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.namespace.snapshot().await.unwrap(), before);
    assert!(h.manager.record().await.unwrap().is_none());
    // The first batch already landed and stays.
    assert_eq!(h.gateway.collection_len("saved_items").await, 2);

    let retried = h.manager.run().await.unwrap();
    assert!(matches!(retried, MigrationOutcome::Completed(_)));
    assert_eq!(h.gateway.collection_len("saved_items").await, 3);
}

#[tokio::test]
async fn test_expired_legacy_keys_are_purged_after_grace_period() {
    let h = harness(legacy_namespace("legacy-7"));
    h.manager.run().await.unwrap();

    assert!(h.manager.purge_expired().await.unwrap().is_empty());
    h.clock.advance(Duration::days(29));
    assert!(h.manager.purge_expired().await.unwrap().is_empty());

    h.clock.advance(Duration::days(2));
    let purged = h.manager.purge_expired().await.unwrap();
    assert_eq!(purged.len(), 3);
    assert!(h.namespace.peek("savedItems").await.is_none());
    assert!(h.namespace.peek("userId").await.is_none());
    assert_eq!(h.namespace.peek("theme").await, Some("dark".to_string()));
    assert!(h.manager.pending_deletion().await.unwrap().is_none());
    assert!(h.manager.record().await.unwrap().is_some());
}

#[tokio::test]
async fn test_clean_namespace_needs_nothing() {
    let h = harness(InMemoryNamespace::with_entries([("theme", "dark")]));

    assert!(!h.manager.needs_migration().await.unwrap());
    assert_eq!(h.manager.run().await.unwrap(), MigrationOutcome::NotNeeded);
    assert_eq!(h.namespace.mutations(), 0);
    assert_eq!(h.backup.writes(), 0);
}

#[tokio::test]
async fn test_current_format_legacy_id_is_kept() {
    let h = harness(legacy_namespace("\"user_0123abcd\""));

    let report = match h.manager.run().await.unwrap() {
        MigrationOutcome::Completed(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };

    assert_eq!(report.identity.id, "user_0123abcd");
    assert_eq!(report.identity.origin_method, OriginMethod::Migrated);
    assert!(h.gateway.document("saved_items", "user_0123abcd_m1").await.is_some());
}

#[tokio::test]
async fn test_restore_backup_rewinds_namespace() {
    let h = harness(legacy_namespace("legacy-7"));
    let before: BTreeMap<String, String> = h.namespace.snapshot().await.unwrap();
    h.manager.run().await.unwrap();
    h.namespace.set("theme", "light").await.unwrap();

    assert!(h.manager.restore_backup().await.unwrap());
    assert_eq!(h.namespace.snapshot().await.unwrap(), before);
}

#[tokio::test]
async fn test_old_format_canonical_id_is_replaced() {
    let h = harness(InMemoryNamespace::with_entries([
        ("device_user_id", "1699999999999_k3j2h1"),
        ("theme", "dark"),
    ]));
    h.page.set("device_user_id", "1699999999999_k3j2h1").await.unwrap();
    assert!(h.manager.needs_migration().await.unwrap());

    let report = match h.manager.run().await.unwrap() {
        MigrationOutcome::Completed(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };

    assert!(report.identity.id.starts_with("fp_"));
    assert_eq!(report.identity.origin_method, OriginMethod::Migrated);
    assert_eq!(h.page.peek("device_user_id").await, Some(report.identity.id.clone()));
    assert_eq!(h.namespace.peek("device_user_id").await, Some(report.identity.id.clone()));
    assert_eq!(report.batches, 0);
    assert!(report.scheduled_for_deletion.is_empty());
    assert!(!h.manager.needs_migration().await.unwrap());

    let backup = h.manager.load_backup().await.unwrap().unwrap();
    assert_eq!(
        backup.entries.get("device_user_id"),
        Some(&"1699999999999_k3j2h1".to_string())
    );
}
