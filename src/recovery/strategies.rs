use super::RecoveryStrategy;
use crate::config::IdentityConfig;
use crate::core::{Clock, Fingerprint, Identity, OriginMethod, Result};
use crate::identity::{IdentityStore, fingerprint_identity_id};
use crate::remote::RemoteDataGateway;
use crate::retry::{retry_with_backoff, with_timeout};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Remote index of previously seen device signatures.
///
/// Optional; without one the device-signature strategy is skipped.
#[async_trait]
pub trait DeviceSignatureIndex: Send + Sync {
    /// The identity last seen with this fingerprint, if any.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<String>>;
}

/// A fixed fingerprint-to-identity table.
#[derive(Debug, Default)]
pub struct StaticSignatureIndex {
    entries: HashMap<String, String>,
    lookups: AtomicUsize,
}

impl StaticSignatureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, fingerprint: &str, identity: &str) -> Self {
        self.entries.insert(fingerprint.to_string(), identity.to_string());
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSignatureIndex for StaticSignatureIndex {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(fingerprint.as_str()).cloned())
    }
}

pub(super) enum StrategyResult {
    Recovered(Identity),
    NotFound(String),
    Skipped(String),
}

pub(super) struct StrategyContext<'a> {
    pub store: &'a IdentityStore,
    pub gateway: &'a dyn RemoteDataGateway,
    pub signatures: Option<&'a dyn DeviceSignatureIndex>,
    pub config: &'a IdentityConfig,
    pub clock: &'a dyn Clock,
}

impl StrategyContext<'_> {
    pub async fn run(&self, strategy: RecoveryStrategy) -> StrategyResult {
        match strategy {
            RecoveryStrategy::StorageSweep => self.storage_sweep().await,
            RecoveryStrategy::FingerprintVerification => self.fingerprint_verification().await,
            RecoveryStrategy::DeviceSignature => self.device_signature().await,
        }
    }

    /// An identity minted by this very session is not a recovery.
    async fn storage_sweep(&self) -> StrategyResult {
        let Some(stored) = self.store.sweep().await else {
            return StrategyResult::NotFound("no backend holds an identity".to_string());
        };
        if self.store.minted_id().await.as_deref() == Some(stored.identity.id.as_str()) {
            return StrategyResult::NotFound(format!(
                "only the identity minted this session was found in {}",
                stored.source
            ));
        }
        StrategyResult::Recovered(stored.identity.with_origin(OriginMethod::RecoveredStorage))
    }

    async fn fingerprint_verification(&self) -> StrategyResult {
        let fingerprint = self.store.fingerprint().compute().await;
        let candidate = fingerprint_identity_id(&fingerprint);
        let limit = Duration::from_millis(self.config.recovery.verification_timeout_ms);

        match with_timeout(limit, "fingerprint verification", self.owns_remote_data(&candidate)).await {
            Ok(true) => StrategyResult::Recovered(self.recovered(candidate, OriginMethod::RecoveredFingerprintVerified).await),
            Ok(false) => StrategyResult::NotFound(format!("no remote records under {}", candidate)),
            Err(err) => StrategyResult::NotFound(format!("verification of {} failed: {}", candidate, err)),
        }
    }

    async fn owns_remote_data(&self, candidate: &str) -> Result<bool> {
        let collections = &self.config.collections;
        let owner = json!(candidate);
        for collection in [&collections.saved_items, &collections.watch_progress] {
            let docs = retry_with_backoff(&self.config.retry, "fingerprint verification", || {
                self.gateway.query(collection, &collections.owner_field, &owner, 1)
            })
            .await?;
            if !docs.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn device_signature(&self) -> StrategyResult {
        let Some(index) = self.signatures else {
            return StrategyResult::Skipped("no device signature index configured".to_string());
        };

        let fingerprint = self.store.fingerprint().compute().await;
        let limit = Duration::from_millis(self.config.recovery.verification_timeout_ms);
        match with_timeout(limit, "device signature lookup", index.lookup(&fingerprint)).await {
            Ok(Some(id)) if !id.trim().is_empty() => StrategyResult::Recovered(
                self.recovered(id.trim().to_string(), OriginMethod::RecoveredDeviceSignature)
                    .await,
            ),
            Ok(_) => StrategyResult::NotFound(format!("no device signature matches {}", fingerprint)),
            Err(err) => StrategyResult::NotFound(format!("device signature lookup failed: {}", err)),
        }
    }

    /// Keeps the creation time when the candidate is the session identity.
    async fn recovered(&self, id: String, origin: OriginMethod) -> Identity {
        match self.store.current().await {
            Some(current) if current.id == id => current.with_origin(origin),
            _ => Identity::new(id, self.clock.now(), origin),
        }
    }
}
