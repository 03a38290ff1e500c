//! Cascading identity recovery after apparent loss.
//!
//! The orchestrator moves `Idle -> Running -> Succeeded | Failed` once per
//! session. Strategies run in [`RecoveryStrategy::CASCADE`] order and the
//! first success short-circuits the rest. A recovered identity is adopted
//! through the [`IdentityStore`] and then validated with a remote round-trip
//! probe.

pub mod manual;
pub mod strategies;
pub mod validation;

pub use manual::{
    ManualRecoveryContext, ManualRecoveryPresenter, NoopPresenter, RecordingPresenter,
};
pub use strategies::{DeviceSignatureIndex, StaticSignatureIndex};
pub use validation::{ValidationLevel, ValidationProbe, ValidationReport};

use crate::config::{IdentityConfig, RecoveryPolicy};
use crate::core::{Clock, Identity};
use crate::detector::LossReport;
use crate::identity::IdentityStore;
use crate::remote::RemoteDataGateway;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use strategies::{StrategyContext, StrategyResult};
use tokio::sync::{OnceCell, RwLock};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    StorageSweep,
    FingerprintVerification,
    DeviceSignature,
}

impl RecoveryStrategy {
    pub const CASCADE: [RecoveryStrategy; 3] = [
        RecoveryStrategy::StorageSweep,
        RecoveryStrategy::FingerprintVerification,
        RecoveryStrategy::DeviceSignature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageSweep => "storage_sweep",
            Self::FingerprintVerification => "fingerprint_verification",
            Self::DeviceSignature => "device_signature",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Fail,
    Skipped,
}

/// One entry of the per-run diagnostic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub strategy: RecoveryStrategy,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

/// What a recovery run concluded. Returned unchanged by every later call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub state: RecoveryState,
    /// The adopted identity, on success.
    pub identity: Option<Identity>,
    pub validation: Option<ValidationReport>,
    pub attempts: Vec<RecoveryAttempt>,
    /// The manual recovery collaborator was signalled.
    pub manual_recovery_requested: bool,
}

impl RecoveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RecoveryState::Succeeded
    }

    /// Strategies that were actually executed, in order.
    pub fn executed(&self) -> Vec<RecoveryStrategy> {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome != AttemptOutcome::Skipped)
            .map(|attempt| attempt.strategy)
            .collect()
    }
}

pub struct RecoveryOrchestrator {
    store: Arc<IdentityStore>,
    gateway: Arc<dyn RemoteDataGateway>,
    presenter: Arc<dyn ManualRecoveryPresenter>,
    signatures: Option<Arc<dyn DeviceSignatureIndex>>,
    probe: ValidationProbe,
    config: IdentityConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<RecoveryState>,
    latch: OnceCell<RecoveryOutcome>,
}

impl RecoveryOrchestrator {
    pub fn new(
        store: Arc<IdentityStore>,
        gateway: Arc<dyn RemoteDataGateway>,
        presenter: Arc<dyn ManualRecoveryPresenter>,
        config: &IdentityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let probe = ValidationProbe::new(gateway.clone(), config, clock.clone());
        Self {
            store,
            gateway,
            presenter,
            signatures: None,
            probe,
            config: config.clone(),
            clock,
            state: RwLock::new(RecoveryState::Idle),
            latch: OnceCell::new(),
        }
    }

    pub fn with_signature_index(mut self, index: Arc<dyn DeviceSignatureIndex>) -> Self {
        self.signatures = Some(index);
        self
    }

    pub async fn state(&self) -> RecoveryState {
        *self.state.read().await
    }

    /// The outcome of this session's run, if it has finished.
    pub fn outcome(&self) -> Option<&RecoveryOutcome> {
        self.latch.get()
    }

    fn policy(&self) -> &RecoveryPolicy {
        &self.config.recovery
    }

    /// Runs the cascade once per session.
    ///
    /// Concurrent and later callers receive the first run's outcome.
    pub async fn run(&self, loss: Option<&LossReport>) -> RecoveryOutcome {
        self.latch
            .get_or_init(|| async {
                let span = info_span!("identity.recovery");
                self.run_cascade(loss).instrument(span).await
            })
            .await
            .clone()
    }

    async fn run_cascade(&self, loss: Option<&LossReport>) -> RecoveryOutcome {
        *self.state.write().await = RecoveryState::Running;
        event!(Level::INFO, "identity recovery started");

        let mut attempts: Vec<RecoveryAttempt> = Vec::new();
        let mut executed = 0u32;
        let ceiling = self.policy().max_attempts.max(1);
        let context = StrategyContext {
            store: &self.store,
            gateway: self.gateway.as_ref(),
            signatures: self.signatures.as_deref(),
            config: &self.config,
            clock: self.clock.as_ref(),
        };

        // Each strategy runs at most once per cascade.
        let mut recovered = None;
        for strategy in RecoveryStrategy::CASCADE {
            if executed >= ceiling {
                self.record(&mut attempts, strategy, AttemptOutcome::Skipped, Some("attempt ceiling reached".to_string()));
                continue;
            }

            match context.run(strategy).await {
                StrategyResult::Recovered(identity) => {
                    executed += 1;
                    self.record(&mut attempts, strategy, AttemptOutcome::Success, Some(identity.id.clone()));
                    recovered = Some(identity);
                    break;
                }
                StrategyResult::NotFound(detail) => {
                    executed += 1;
                    self.record(&mut attempts, strategy, AttemptOutcome::Fail, Some(detail));
                }
                StrategyResult::Skipped(detail) => {
                    self.record(&mut attempts, strategy, AttemptOutcome::Skipped, Some(detail));
                }
            }
        }

        let outcome = match recovered {
            Some(identity) => {
                let identity = self.store.adopt(identity).await;
                let validation = self.probe.validate(&identity.id).await;
                event!(
                    Level::INFO,
                    identity = %identity.id,
                    origin = %identity.origin_method,
                    validation = %validation.level,
                    "identity recovered"
                );
                RecoveryOutcome {
                    state: RecoveryState::Succeeded,
                    identity: Some(identity),
                    validation: Some(validation),
                    attempts,
                    manual_recovery_requested: false,
                }
            }
            None => {
                let context = ManualRecoveryContext {
                    current: self.store.current().await,
                    attempts: attempts.clone(),
                    loss: loss.cloned(),
                    likely_first_visit: !self.store.previous_visit(),
                };
                event!(
                    Level::WARN,
                    attempts = attempts.len(),
                    likely_first_visit = context.likely_first_visit,
                    "identity recovery exhausted, manual recovery requested"
                );
                self.presenter.present_manual_recovery_options(&context).await;
                RecoveryOutcome {
                    state: RecoveryState::Failed,
                    identity: None,
                    validation: None,
                    attempts,
                    manual_recovery_requested: true,
                }
            }
        };

        *self.state.write().await = outcome.state;
        outcome
    }

    fn record(
        &self,
        attempts: &mut Vec<RecoveryAttempt>,
        strategy: RecoveryStrategy,
        outcome: AttemptOutcome,
        detail: Option<String>,
    ) {
        if outcome == AttemptOutcome::Fail {
            event!(Level::WARN, strategy = %strategy, detail = detail.as_deref().unwrap_or(""), "recovery strategy failed");
        } else {
            event!(Level::INFO, strategy = %strategy, outcome = ?outcome, detail = detail.as_deref().unwrap_or(""), "recovery strategy finished");
        }
        attempts.push(RecoveryAttempt {
            strategy,
            outcome,
            timestamp: self.clock.now(),
            detail,
        });
    }
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("signature_index", &self.signatures.is_some())
            .field("finished", &self.latch.initialized())
            .finish()
    }
}
