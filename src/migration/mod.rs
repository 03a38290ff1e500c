//! One-time, versioned migration of legacy local data.
//!
//! A run snapshots the local namespace into a durable backup before touching
//! anything, settles on a current-format identity, moves legacy records to the
//! remote store in batches, schedules the legacy keys for deletion after a
//! grace period and finally writes a completion marker. A failure after the
//! backup restores the snapshot. Remote writes that already landed stay; they
//! carry the run id and deterministic document ids, so a later run overwrites
//! them instead of duplicating.

pub mod legacy;

pub use legacy::{LegacyPlan, LegacyPlanner, RUN_ID_FIELD, normalize_legacy_id};

use crate::config::{IdentityConfig, MigrationPolicy};
use crate::core::{Clock, Identity, IdentityError, OriginMethod, Result};
use crate::identity::{IdentityStore, is_current_format, mint_identity_id};
use crate::remote::RemoteDataGateway;
use crate::retry::retry_with_backoff;
use crate::storage::{LocalNamespace, StorageBackend};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Completion marker, stored once per version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: u32,
    /// `<backend>:<key>` of the durable backup.
    pub backup_handle: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_id: String,
}

/// Durable copy of the namespace taken before a run mutates anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationBackup {
    pub version: u32,
    pub run_id: String,
    pub taken_at: DateTime<Utc>,
    pub entries: BTreeMap<String, String>,
}

/// Legacy keys awaiting removal by [`MigrationManager::purge_expired`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeletion {
    pub keys: Vec<String>,
    pub delete_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub run_id: String,
    pub identity: Identity,
    pub saved_items_moved: usize,
    pub progress_moved: usize,
    pub batches: usize,
    pub skipped: usize,
    pub scheduled_for_deletion: Vec<String>,
    pub record: MigrationRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Nothing legacy-shaped was found.
    NotNeeded,
    /// The marker for this version exists.
    AlreadyCompleted(MigrationRecord),
    Completed(MigrationReport),
    /// The backup could not be secured; nothing was mutated.
    Aborted { error: String },
    /// The run failed after the backup; `restored` tells whether the
    /// namespace was put back.
    RolledBack { error: String, restored: bool },
}

pub struct MigrationManager {
    store: Arc<IdentityStore>,
    gateway: Arc<dyn RemoteDataGateway>,
    namespace: Arc<dyn LocalNamespace>,
    backup: Arc<dyn StorageBackend>,
    config: IdentityConfig,
    clock: Arc<dyn Clock>,
}

impl MigrationManager {
    pub fn new(
        store: Arc<IdentityStore>,
        gateway: Arc<dyn RemoteDataGateway>,
        namespace: Arc<dyn LocalNamespace>,
        backup: Arc<dyn StorageBackend>,
        config: &IdentityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            namespace,
            backup,
            config: config.clone(),
            clock,
        }
    }

    fn policy(&self) -> &MigrationPolicy {
        &self.config.migration
    }

    /// The completion marker of the configured version.
    pub async fn record(&self) -> Result<Option<MigrationRecord>> {
        match self.namespace.get(&self.policy().marker_key()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn needs_migration(&self) -> Result<bool> {
        if self.record().await?.is_some() {
            return Ok(false);
        }
        if !self.present_legacy_keys().await?.is_empty() {
            return Ok(true);
        }
        Ok(self.legacy_format_identity().await?.is_some())
    }

    async fn present_legacy_keys(&self) -> Result<Vec<String>> {
        let existing: BTreeSet<String> = self.namespace.keys().await?.into_iter().collect();
        Ok(self
            .policy()
            .legacy_keys()
            .into_iter()
            .filter(|key| existing.contains(key))
            .collect())
    }

    /// An old-format value under the canonical identity key, read from the
    /// namespace and then from every identity backend.
    async fn legacy_format_identity(&self) -> Result<Option<String>> {
        let key = &self.config.keys.identity;
        let mut candidates = vec![self.namespace.get(key).await?];
        for backend in self.store.backends() {
            // An unreadable tier cannot hold anything to normalize.
            candidates.push(backend.get(key).await.ok().flatten());
        }
        Ok(candidates
            .into_iter()
            .flatten()
            .map(|raw| raw.trim().to_string())
            .find(|id| !id.is_empty() && !is_current_format(id)))
    }

    /// Runs the migration for the configured version.
    ///
    /// Returns `Err` only when the namespace could not be inspected.
    pub async fn run(&self) -> Result<MigrationOutcome> {
        let span = info_span!("identity.migration", version = self.policy().version);
        async {
            if let Some(record) = self.record().await? {
                event!(Level::DEBUG, run_id = %record.run_id, "migration already completed");
                return Ok(MigrationOutcome::AlreadyCompleted(record));
            }
            let legacy_keys = self.present_legacy_keys().await?;
            if legacy_keys.is_empty() && self.legacy_format_identity().await?.is_none() {
                return Ok(MigrationOutcome::NotNeeded);
            }

            let run_id = Uuid::new_v4().simple().to_string();
            let snapshot = match self.secure_backup(&run_id).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    event!(Level::ERROR, run_id = %run_id, error = %err, "migration aborted before any mutation");
                    return Ok(MigrationOutcome::Aborted {
                        error: err.to_string(),
                    });
                }
            };
            event!(Level::INFO, run_id = %run_id, entries = snapshot.len(), "migration backup stored");

            match self.migrate(&run_id, &snapshot, legacy_keys).await {
                Ok(report) => {
                    event!(
                        Level::INFO,
                        run_id = %run_id,
                        identity = %report.identity.id,
                        saved_items = report.saved_items_moved,
                        progress = report.progress_moved,
                        batches = report.batches,
                        skipped = report.skipped,
                        "migration completed"
                    );
                    Ok(MigrationOutcome::Completed(report))
                }
                Err(err) => {
                    event!(Level::ERROR, run_id = %run_id, error = %err, "migration failed, rolling back");
                    let restored = match self.namespace.restore(&snapshot).await {
                        Ok(()) => true,
                        Err(rollback_err) => {
                            event!(Level::ERROR, run_id = %run_id, error = %rollback_err, "migration rollback failed");
                            false
                        }
                    };
                    Ok(MigrationOutcome::RolledBack {
                        error: err.to_string(),
                        restored,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    fn backup_handle(&self) -> String {
        format!("{}:{}", self.backup.name(), self.policy().backup_key())
    }

    /// Writes the backup and reads it back before anything is mutated.
    async fn secure_backup(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        let entries = self.namespace.snapshot().await?;
        let backup = MigrationBackup {
            version: self.policy().version,
            run_id: run_id.to_string(),
            taken_at: self.clock.now(),
            entries,
        };
        let serialized = serde_json::to_string(&backup)?;
        let key = self.policy().backup_key();

        self.backup.set(&key, &serialized).await.map_err(|err| {
            IdentityError::Migration(format!("backup write to {} failed: {}", self.backup.name(), err))
        })?;
        match self.backup.get(&key).await? {
            Some(stored) if stored == serialized => Ok(backup.entries),
            _ => Err(IdentityError::Migration(format!(
                "backup in {} could not be verified",
                self.backup.name()
            ))),
        }
    }

    async fn migrate(
        &self,
        run_id: &str,
        snapshot: &BTreeMap<String, String>,
        legacy_keys: Vec<String>,
    ) -> Result<MigrationReport> {
        let policy = self.policy();
        let now = self.clock.now();
        let identity = self.settle_identity(snapshot).await?;

        let migrated_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let planner = LegacyPlanner {
            collections: &self.config.collections,
            identity: &identity.id,
            run_id,
            migrated_at: &migrated_at,
        };
        let mut plan = LegacyPlan::default();
        if let Some(raw) = snapshot.get(&policy.legacy_saved_items_key) {
            planner.saved_items(raw, &mut plan);
        }
        if let Some(raw) = snapshot.get(&policy.legacy_progress_key) {
            planner.progress(raw, &mut plan);
        }

        let mut batches = 0;
        for chunk in plan.ops.chunks(policy.batch_size.max(1)) {
            retry_with_backoff(&self.config.retry, "migration batch", || {
                self.gateway.batch_write(chunk.to_vec())
            })
            .await?;
            batches += 1;
            event!(Level::DEBUG, run_id, batch = batches, ops = chunk.len(), "migration batch written");
        }

        let scheduled = self.schedule_deletion(legacy_keys, now).await?;

        let record = MigrationRecord {
            version: policy.version,
            backup_handle: self.backup_handle(),
            completed_at: Some(now),
            run_id: run_id.to_string(),
        };
        self.namespace
            .set(&policy.marker_key(), &serde_json::to_string(&record)?)
            .await?;

        Ok(MigrationReport {
            run_id: run_id.to_string(),
            identity,
            saved_items_moved: plan.saved_items,
            progress_moved: plan.progress_entries,
            batches,
            skipped: plan.skipped,
            scheduled_for_deletion: scheduled,
            record,
        })
    }

    /// A stored current-format identity wins. A stored old-format one is
    /// replaced by a freshly minted id that keeps its creation time. Otherwise
    /// a current-format legacy id is kept, and failing that the freshly
    /// generated identity is claimed by the migration.
    async fn settle_identity(&self, snapshot: &BTreeMap<String, String>) -> Result<Identity> {
        let resolved = self.store.resolve().await;
        let identity = if !is_current_format(&resolved.id) {
            self.replace_legacy_format(resolved).await
        } else if resolved.origin_method != OriginMethod::Generated {
            resolved
        } else {
            self.claim_generated(snapshot, resolved).await
        };

        let key = &self.config.keys.identity;
        if let Some(stale) = self.namespace.get(key).await? {
            if !is_current_format(stale.trim()) {
                self.namespace.set(key, &identity.id).await?;
            }
        }
        Ok(identity)
    }

    async fn replace_legacy_format(&self, resolved: Identity) -> Identity {
        let fingerprint = self.store.fingerprint().compute().await;
        let id = mint_identity_id(self.config.id_scheme, &fingerprint);
        event!(Level::INFO, legacy = %resolved.id, identity = %id, "legacy-format identity replaced");
        self.store
            .adopt(Identity::new(id, resolved.created_at, OriginMethod::Migrated))
            .await
    }

    async fn claim_generated(&self, snapshot: &BTreeMap<String, String>, resolved: Identity) -> Identity {
        let legacy_id = snapshot
            .get(&self.policy().legacy_identity_key)
            .and_then(|raw| normalize_legacy_id(raw))
            .filter(|id| is_current_format(id));
        let identity = match legacy_id {
            Some(id) => Identity::new(id, self.clock.now(), OriginMethod::Migrated),
            None => resolved.with_origin(OriginMethod::Migrated),
        };
        self.store.adopt(identity).await
    }

    async fn schedule_deletion(&self, keys: Vec<String>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let policy = self.policy();
        let mut pending: BTreeSet<String> = keys.into_iter().collect();
        if let Some(existing) = self.pending_deletion().await? {
            pending.extend(existing.keys);
        }

        let marker = PendingDeletion {
            keys: pending.into_iter().collect(),
            delete_after: now + Duration::days(policy.grace_period_days),
        };
        self.namespace
            .set(&policy.pending_deletion_key, &serde_json::to_string(&marker)?)
            .await?;
        Ok(marker.keys)
    }

    pub async fn pending_deletion(&self) -> Result<Option<PendingDeletion>> {
        match self.namespace.get(&self.policy().pending_deletion_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Removes legacy keys whose grace period has elapsed.
    pub async fn purge_expired(&self) -> Result<Vec<String>> {
        let Some(pending) = self.pending_deletion().await? else {
            return Ok(Vec::new());
        };
        if self.clock.now() < pending.delete_after {
            return Ok(Vec::new());
        }

        for key in &pending.keys {
            self.namespace.remove(key).await?;
        }
        self.namespace.remove(&self.policy().pending_deletion_key).await?;
        event!(Level::INFO, keys = pending.keys.len(), "expired legacy keys purged");
        Ok(pending.keys)
    }

    /// Reads the durable backup of the configured version.
    pub async fn load_backup(&self) -> Result<Option<MigrationBackup>> {
        match self.backup.get(&self.policy().backup_key()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Puts the namespace back to the durable backup.
    pub async fn restore_backup(&self) -> Result<bool> {
        let Some(backup) = self.load_backup().await? else {
            return Ok(false);
        };
        self.namespace.restore(&backup.entries).await?;
        event!(Level::INFO, run_id = %backup.run_id, "namespace restored from migration backup");
        Ok(true)
    }
}
