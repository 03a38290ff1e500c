use super::mint_identity_id;
use crate::config::{IdScheme, IdentityConfig, IdentityKeys};
use crate::core::{Clock, Identity, IdentityError, OriginMethod, Result};
use crate::fingerprint::FingerprintGenerator;
use crate::storage::{StorageBackend, StorageTier};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OnceCell, RwLock};
use tracing::{Instrument, Level, event, info_span};

/// An identity read back from storage and the tier that held it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub identity: Identity,
    pub source: StorageTier,
    /// Faster tiers the value was written back into.
    pub repaired: Vec<StorageTier>,
}

/// Per-backend result of a persist.
#[derive(Debug, Clone, Default)]
pub struct PersistReport {
    pub succeeded: Vec<StorageTier>,
    pub failed: Vec<(StorageTier, IdentityError)>,
}

impl PersistReport {
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty()
    }
}

/// Resolves the session identity from redundant storage tiers.
///
/// Backends are consulted fastest first. A hit in a slower tier is written back
/// into every faster tier, which is how the identity survives partial clears.
/// Concurrent `resolve` calls share one in-flight computation.
pub struct IdentityStore {
    backends: Vec<Arc<dyn StorageBackend>>,
    fingerprint: Arc<FingerprintGenerator>,
    keys: IdentityKeys,
    id_scheme: IdScheme,
    clock: Arc<dyn Clock>,
    resolution: OnceCell<Identity>,
    current: RwLock<Option<Identity>>,
    minted: RwLock<Option<String>>,
    previous_visit: AtomicBool,
}

impl IdentityStore {
    pub fn new(
        mut backends: Vec<Arc<dyn StorageBackend>>,
        fingerprint: Arc<FingerprintGenerator>,
        config: &IdentityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        backends.sort_by_key(|backend| backend.tier().priority());
        Self {
            backends,
            fingerprint,
            keys: config.keys.clone(),
            id_scheme: config.id_scheme,
            clock,
            resolution: OnceCell::new(),
            current: RwLock::new(None),
            minted: RwLock::new(None),
            previous_visit: AtomicBool::new(false),
        }
    }

    pub fn backends(&self) -> &[Arc<dyn StorageBackend>] {
        &self.backends
    }

    pub fn fingerprint(&self) -> &Arc<FingerprintGenerator> {
        &self.fingerprint
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    /// Returns the session identity, resolving it on first use.
    ///
    /// Never fails: when no backend accepts a newly minted identity it is kept
    /// as a session-only identity.
    pub async fn resolve(&self) -> Identity {
        if let Some(identity) = self.current.read().await.clone() {
            return identity;
        }

        let resolved = self
            .resolution
            .get_or_init(|| self.resolve_uncached())
            .await
            .clone();

        // An adoption racing the first resolution wins.
        let mut current = self.current.write().await;
        match current.as_ref() {
            Some(adopted) => adopted.clone(),
            None => {
                *current = Some(resolved.clone());
                resolved
            }
        }
    }

    async fn resolve_uncached(&self) -> Identity {
        let span = info_span!("identity.resolve", backends = self.backends.len());
        async {
            if let Some(stored) = self.lookup().await {
                self.previous_visit.store(true, Ordering::SeqCst);
                event!(
                    Level::INFO,
                    identity = %stored.identity.id,
                    source = %stored.source,
                    repaired = stored.repaired.len(),
                    "identity resolved from storage"
                );
                return stored.identity;
            }

            // Must be observed before the mint writes a fresh breadcrumb.
            let breadcrumb = self.breadcrumb_present().await;
            self.previous_visit.store(breadcrumb, Ordering::SeqCst);

            let fingerprint = self.fingerprint.compute().await;
            let id = mint_identity_id(self.id_scheme, &fingerprint);
            let identity = Identity::new(id, self.clock.now(), OriginMethod::Generated);
            *self.minted.write().await = Some(identity.id.clone());

            match self.persist(&identity).await {
                Ok(report) => {
                    event!(
                        Level::INFO,
                        identity = %identity.id,
                        persisted = report.succeeded.len(),
                        failed = report.failed.len(),
                        "identity generated"
                    );
                    identity
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        identity = %identity.id,
                        error = %err,
                        "identity generated but kept for this session only"
                    );
                    identity.session_only()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Re-reads every backend, bypassing the memoized resolution, and repairs
    /// faster tiers from the first hit.
    pub async fn sweep(&self) -> Option<StoredIdentity> {
        let span = info_span!("identity.sweep");
        self.lookup().instrument(span).await
    }

    async fn lookup(&self) -> Option<StoredIdentity> {
        for (index, backend) in self.backends.iter().enumerate() {
            let value = match backend.get(&self.keys.identity).await {
                Ok(value) => value,
                Err(err) => {
                    event!(
                        Level::WARN,
                        backend = backend.name(),
                        error = %err,
                        "identity read failed"
                    );
                    continue;
                }
            };

            let Some(id) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
                continue;
            };

            let created_at = self.read_created_at(backend.as_ref()).await;
            let identity = Identity::new(id, created_at, OriginMethod::RecoveredStorage);
            let repaired = self.repair(&self.backends[..index], &identity).await;
            return Some(StoredIdentity {
                identity,
                source: backend.tier(),
                repaired,
            });
        }
        None
    }

    async fn read_created_at(&self, backend: &dyn StorageBackend) -> DateTime<Utc> {
        match backend.get(&self.keys.created_at).await {
            Ok(Some(raw)) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            _ => DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    async fn repair(&self, targets: &[Arc<dyn StorageBackend>], identity: &Identity) -> Vec<StorageTier> {
        let results = join_all(
            targets
                .iter()
                .map(|backend| async move { (backend.tier(), self.write_to(backend.as_ref(), identity).await) }),
        )
        .await;

        let mut repaired = Vec::new();
        for (tier, result) in results {
            match result {
                Ok(()) => {
                    event!(Level::DEBUG, backend = %tier, identity = %identity.id, "identity repaired");
                    repaired.push(tier);
                }
                Err(err) => {
                    event!(Level::WARN, backend = %tier, error = %err, "identity repair failed");
                }
            }
        }
        repaired
    }

    /// Writes the identity to every backend independently.
    ///
    /// Individual failures are logged; only when every backend fails is
    /// [`IdentityError::IdentityUnavailable`] returned.
    pub async fn persist(&self, identity: &Identity) -> Result<PersistReport> {
        let results = join_all(
            self.backends
                .iter()
                .map(|backend| async move { (backend.tier(), self.write_to(backend.as_ref(), identity).await) }),
        )
        .await;

        let mut report = PersistReport::default();
        for (tier, result) in results {
            match result {
                Ok(()) => report.succeeded.push(tier),
                Err(err) => {
                    event!(
                        Level::WARN,
                        backend = %tier,
                        identity = %identity.id,
                        error = %err,
                        "identity persist failed"
                    );
                    report.failed.push((tier, err));
                }
            }
        }

        if report.all_failed() {
            return Err(IdentityError::IdentityUnavailable);
        }
        Ok(report)
    }

    /// The identity key decides success; companion keys are best effort.
    async fn write_to(&self, backend: &dyn StorageBackend, identity: &Identity) -> Result<()> {
        backend.set(&self.keys.identity, &identity.id).await?;

        let created_at = identity
            .created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        for key in [&self.keys.created_at, &self.keys.breadcrumb] {
            if let Err(err) = backend.set(key, &created_at).await {
                event!(
                    Level::DEBUG,
                    backend = backend.name(),
                    key = key.as_str(),
                    error = %err,
                    "identity companion write failed"
                );
            }
        }
        Ok(())
    }

    /// Replaces the session identity. Only recovery and migration call this.
    pub async fn adopt(&self, identity: Identity) -> Identity {
        let identity = match self.persist(&identity).await {
            Ok(_) => identity,
            Err(err) => {
                event!(Level::ERROR, identity = %identity.id, error = %err, "adopted identity is session only");
                identity.session_only()
            }
        };

        let mut current = self.current.write().await;
        let previous = current.as_ref().map(|existing| existing.id.clone());
        event!(
            Level::INFO,
            identity = %identity.id,
            origin = %identity.origin_method,
            previous = previous.as_deref().unwrap_or("none"),
            "identity adopted"
        );
        *current = Some(identity.clone());
        identity
    }

    /// The identity of this session, if one has been resolved or adopted.
    pub async fn current(&self) -> Option<Identity> {
        self.current.read().await.clone()
    }

    /// The id minted by this session when storage held nothing.
    pub async fn minted_id(&self) -> Option<String> {
        self.minted.read().await.clone()
    }

    /// Whether storage showed signs of an earlier visit when the session
    /// identity was first resolved.
    pub fn previous_visit(&self) -> bool {
        self.previous_visit.load(Ordering::SeqCst)
    }

    /// Whether any backend currently holds a visit breadcrumb.
    pub async fn breadcrumb_present(&self) -> bool {
        for backend in &self.backends {
            if let Ok(Some(value)) = backend.get(&self.keys.breadcrumb).await {
                if !value.trim().is_empty() {
                    return true;
                }
            }
        }
        false
    }
}
