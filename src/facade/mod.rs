//! Single entry point wiring every component together.
//!
//! The subsystem is built once with injected backends and collaborators.
//! [`IdentitySubsystem::ready`] runs migration, resolution, loss detection and,
//! when needed, recovery exactly once; every consumer awaits the same boot
//! before touching identity-partitioned remote data.

pub mod monitor;

pub use monitor::{LossMonitor, LossScan, spawn_loss_monitor};

use crate::config::IdentityConfig;
use crate::core::{Clock, Identity, IdentityError, OriginMethod, Result, SystemClock};
use crate::detector::{DataLossDetector, LossReport};
use crate::fingerprint::{FingerprintGenerator, HostSignalCollector, SignalCollector};
use crate::identity::IdentityStore;
use crate::migration::{MigrationManager, MigrationOutcome};
use crate::recovery::{
    DeviceSignatureIndex, ManualRecoveryPresenter, NoopPresenter, RecoveryOrchestrator,
    RecoveryOutcome,
};
use crate::remote::RemoteDataGateway;
use crate::storage::{LocalNamespace, StorageBackend, StorageTier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{Instrument, Level, event, info_span};

/// What happened while the subsystem booted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootReport {
    /// The identity every remote read and write is partitioned by.
    pub identity: Identity,
    pub migration: MigrationOutcome,
    pub loss: LossReport,
    /// Present when recovery was triggered.
    pub recovery: Option<RecoveryOutcome>,
}

#[derive(Default)]
pub struct IdentitySubsystemBuilder {
    config: IdentityConfig,
    backends: Vec<Arc<dyn StorageBackend>>,
    gateway: Option<Arc<dyn RemoteDataGateway>>,
    namespace: Option<Arc<dyn LocalNamespace>>,
    backup: Option<Arc<dyn StorageBackend>>,
    collector: Option<Arc<dyn SignalCollector>>,
    presenter: Option<Arc<dyn ManualRecoveryPresenter>>,
    signatures: Option<Arc<dyn DeviceSignatureIndex>>,
    clock: Option<Arc<dyn Clock>>,
}

impl IdentitySubsystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: IdentityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn StorageBackend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn RemoteDataGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn namespace(mut self, namespace: Arc<dyn LocalNamespace>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Where migration backups go. Defaults to the structured database tier,
    /// or the most durable backend when there is none.
    pub fn backup_store(mut self, backup: Arc<dyn StorageBackend>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn signal_collector(mut self, collector: Arc<dyn SignalCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn presenter(mut self, presenter: Arc<dyn ManualRecoveryPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn signature_index(mut self, index: Arc<dyn DeviceSignatureIndex>) -> Self {
        self.signatures = Some(index);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<IdentitySubsystem> {
        self.config.validate()?;
        if self.backends.is_empty() {
            return Err(IdentityError::Config(
                "at least one storage backend is required".to_string(),
            ));
        }
        let gateway = self
            .gateway
            .ok_or_else(|| IdentityError::Config("a remote data gateway is required".to_string()))?;
        let namespace = self
            .namespace
            .ok_or_else(|| IdentityError::Config("a local namespace is required".to_string()))?;

        let backup = match self.backup {
            Some(backup) => backup,
            None => default_backup(&self.backends)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let collector = self
            .collector
            .unwrap_or_else(|| Arc::new(HostSignalCollector));
        let presenter = self.presenter.unwrap_or_else(|| Arc::new(NoopPresenter));

        let generator = Arc::new(FingerprintGenerator::new(collector));
        let store = Arc::new(IdentityStore::new(
            self.backends,
            generator,
            &self.config,
            clock.clone(),
        ));
        let detector = DataLossDetector::new(
            store.clone(),
            gateway.clone(),
            namespace.clone(),
            &self.config,
            clock.clone(),
        );
        let mut recovery = RecoveryOrchestrator::new(
            store.clone(),
            gateway.clone(),
            presenter,
            &self.config,
            clock.clone(),
        );
        if let Some(index) = self.signatures {
            recovery = recovery.with_signature_index(index);
        }
        let migration = MigrationManager::new(
            store.clone(),
            gateway.clone(),
            namespace.clone(),
            backup,
            &self.config,
            clock,
        );

        Ok(IdentitySubsystem {
            store,
            detector,
            recovery,
            migration,
            gateway,
            namespace,
            config: self.config,
            boot: OnceCell::new(),
        })
    }
}

fn default_backup(backends: &[Arc<dyn StorageBackend>]) -> Result<Arc<dyn StorageBackend>> {
    backends
        .iter()
        .find(|backend| backend.tier() == StorageTier::StructuredDatabase)
        .or_else(|| backends.iter().max_by_key(|backend| backend.tier().priority()))
        .cloned()
        .ok_or_else(|| IdentityError::Config("no backend can hold migration backups".to_string()))
}

pub struct IdentitySubsystem {
    store: Arc<IdentityStore>,
    detector: DataLossDetector,
    recovery: RecoveryOrchestrator,
    migration: MigrationManager,
    gateway: Arc<dyn RemoteDataGateway>,
    namespace: Arc<dyn LocalNamespace>,
    config: IdentityConfig,
    boot: OnceCell<BootReport>,
}

impl IdentitySubsystem {
    pub fn builder() -> IdentitySubsystemBuilder {
        IdentitySubsystemBuilder::new()
    }

    /// Boots the subsystem once; concurrent and later callers share the
    /// same report.
    pub async fn ready(&self) -> &BootReport {
        self.boot.get_or_init(|| self.boot_once()).await
    }

    async fn boot_once(&self) -> BootReport {
        let span = info_span!("identity.boot");
        async {
            let migration = match self.migration.run().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    event!(Level::ERROR, error = %err, "migration could not inspect the namespace");
                    MigrationOutcome::Aborted {
                        error: err.to_string(),
                    }
                }
            };

            let resolved = self.store.resolve().await;
            let loss = self.detector.detect().await;

            let recovery = if resolved.origin_method == OriginMethod::Generated || loss.has_data_loss {
                Some(self.recovery.run(Some(&loss)).await)
            } else {
                None
            };

            let identity = self.store.resolve().await;
            event!(
                Level::INFO,
                identity = %identity.id,
                origin = %identity.origin_method,
                persistent = identity.persistent,
                recovery = recovery.is_some(),
                "identity subsystem ready"
            );
            BootReport {
                identity,
                migration,
                loss,
                recovery,
            }
        }
        .instrument(span)
        .await
    }

    /// The session identity, available once boot has finished.
    pub async fn identity(&self) -> Identity {
        self.ready().await.identity.clone()
    }

    /// Runs recovery for a loss observed after boot. Latched per session.
    pub async fn recover(&self, loss: &LossReport) -> RecoveryOutcome {
        self.ready().await;
        self.recovery.run(Some(loss)).await
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn detector(&self) -> &DataLossDetector {
        &self.detector
    }

    pub fn recovery(&self) -> &RecoveryOrchestrator {
        &self.recovery
    }

    pub fn migration(&self) -> &MigrationManager {
        &self.migration
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteDataGateway> {
        &self.gateway
    }

    pub fn namespace(&self) -> &Arc<dyn LocalNamespace> {
        &self.namespace
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }
}
