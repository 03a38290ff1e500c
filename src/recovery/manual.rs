use super::RecoveryAttempt;
use crate::core::Identity;
use crate::detector::LossReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Everything the manual recovery surface needs to explain the situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualRecoveryContext {
    /// The identity the session is running under.
    pub current: Option<Identity>,
    pub attempts: Vec<RecoveryAttempt>,
    pub loss: Option<LossReport>,
    /// No stored identity or breadcrumb existed before this session.
    pub likely_first_visit: bool,
}

/// Collaborator invoked once the recovery cascade is exhausted.
///
/// Advisory only; nothing waits on the user's answer.
#[async_trait]
pub trait ManualRecoveryPresenter: Send + Sync {
    async fn present_manual_recovery_options(&self, context: &ManualRecoveryContext);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresenter;

#[async_trait]
impl ManualRecoveryPresenter for NoopPresenter {
    async fn present_manual_recovery_options(&self, _context: &ManualRecoveryContext) {}
}

/// Keeps every context it was shown.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    shown: Mutex<Vec<ManualRecoveryContext>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presentations(&self) -> Vec<ManualRecoveryContext> {
        self.shown.lock().map(|shown| shown.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.shown.lock().map(|shown| shown.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ManualRecoveryPresenter for RecordingPresenter {
    async fn present_manual_recovery_options(&self, context: &ManualRecoveryContext) {
        if let Ok(mut shown) = self.shown.lock() {
            shown.push(context.clone());
        }
    }
}
