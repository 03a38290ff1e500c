//! Heuristic scoring of apparent identity or data loss.
//!
//! A brand-new visitor and a visitor who lost everything look the same to
//! these indicators; the report's `breadcrumb_present` flag is the only hint
//! that tells them apart, and only for partial clears.

use crate::config::{DetectorPolicy, IdentityConfig, IdentityKeys, RemoteCollections};
use crate::core::{Clock, Identity, Result};
use crate::identity::IdentityStore;
use crate::remote::RemoteDataGateway;
use crate::retry::{RetryPolicy, retry_with_backoff, with_timeout};
use crate::storage::LocalNamespace;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{Level, event};

/// Probability above which loss is reported.
pub const LOSS_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossIndicators {
    /// Identity created moments ago.
    pub new_user_id: bool,
    /// Remote saved-items collection holds nothing for the identity.
    pub no_saved_items: bool,
    /// Display name absent or still a default.
    pub no_user_name: bool,
    /// Local namespace nearly empty.
    pub empty_namespace: bool,
}

impl LossIndicators {
    pub const COUNT: usize = 4;

    pub fn as_pairs(&self) -> [(&'static str, bool); Self::COUNT] {
        [
            ("newUserId", self.new_user_id),
            ("noSavedItems", self.no_saved_items),
            ("noUserName", self.no_user_name),
            ("emptyNamespace", self.empty_namespace),
        ]
    }

    pub fn true_count(&self) -> usize {
        self.as_pairs().iter().filter(|(_, value)| *value).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossReport {
    pub has_data_loss: bool,
    pub probability: f64,
    pub indicators: LossIndicators,
    /// Storage held an identity or a visit breadcrumb before this session.
    pub breadcrumb_present: bool,
    pub checked_at: DateTime<Utc>,
}

impl LossReport {
    pub fn from_indicators(
        indicators: LossIndicators,
        breadcrumb_present: bool,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let probability = indicators.true_count() as f64 / LossIndicators::COUNT as f64;
        Self {
            has_data_loss: probability > LOSS_THRESHOLD,
            probability,
            indicators,
            breadcrumb_present,
            checked_at,
        }
    }
}

pub struct DataLossDetector {
    store: Arc<IdentityStore>,
    gateway: Arc<dyn RemoteDataGateway>,
    namespace: Arc<dyn LocalNamespace>,
    policy: DetectorPolicy,
    keys: IdentityKeys,
    collections: RemoteCollections,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DataLossDetector {
    pub fn new(
        store: Arc<IdentityStore>,
        gateway: Arc<dyn RemoteDataGateway>,
        namespace: Arc<dyn LocalNamespace>,
        config: &IdentityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            namespace,
            policy: config.detector.clone(),
            keys: config.keys.clone(),
            collections: config.collections.clone(),
            retry: config.retry.clone(),
            clock,
        }
    }

    /// Scores the session identity. Unknown indicators count as false.
    pub async fn detect(&self) -> LossReport {
        let identity = self.store.resolve().await;
        let now = self.clock.now();

        let indicators = LossIndicators {
            new_user_id: self.is_fresh(&identity, now),
            no_saved_items: self.has_no_saved_items(&identity).await,
            no_user_name: self.has_no_user_name().await,
            empty_namespace: self.namespace_nearly_empty().await,
        };
        let breadcrumb_present = self.store.previous_visit();
        let report = LossReport::from_indicators(indicators, breadcrumb_present, now);

        event!(
            Level::INFO,
            identity = %identity.id,
            probability = report.probability,
            has_data_loss = report.has_data_loss,
            new_user_id = indicators.new_user_id,
            no_saved_items = indicators.no_saved_items,
            no_user_name = indicators.no_user_name,
            empty_namespace = indicators.empty_namespace,
            breadcrumb_present,
            "data loss check"
        );
        report
    }

    fn is_fresh(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(identity.created_at)
            < Duration::seconds(self.policy.fresh_identity_window_secs)
    }

    async fn has_no_saved_items(&self, identity: &Identity) -> bool {
        match self.count_saved_items(identity).await {
            Ok(found) => found == 0,
            Err(err) => {
                event!(Level::WARN, identity = %identity.id, error = %err, "saved items lookup failed");
                false
            }
        }
    }

    async fn count_saved_items(&self, identity: &Identity) -> Result<usize> {
        let owner = json!(identity.id);
        let limit = StdDuration::from_millis(self.policy.remote_timeout_ms);
        with_timeout(
            limit,
            "saved items lookup",
            retry_with_backoff(&self.retry, "saved items lookup", || {
                self.gateway.query(
                    &self.collections.saved_items,
                    &self.collections.owner_field,
                    &owner,
                    1,
                )
            }),
        )
        .await
        .map(|docs| docs.len())
    }

    async fn has_no_user_name(&self) -> bool {
        match self.namespace.get(&self.keys.display_name).await {
            Ok(Some(name)) => {
                let name = name.trim().trim_matches('"').trim();
                name.is_empty()
                    || self
                        .policy
                        .default_display_names
                        .iter()
                        .any(|default| default.eq_ignore_ascii_case(name))
            }
            Ok(None) => true,
            Err(err) => {
                event!(Level::WARN, error = %err, "display name read failed");
                false
            }
        }
    }

    async fn namespace_nearly_empty(&self) -> bool {
        match self.namespace.keys().await {
            Ok(keys) => keys.len() <= self.policy.nearly_empty_max_keys,
            Err(err) => {
                event!(Level::WARN, error = %err, "namespace enumeration failed");
                false
            }
        }
    }
}
