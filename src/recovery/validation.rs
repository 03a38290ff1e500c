use crate::config::{IdentityConfig, RecoveryPolicy, RemoteCollections};
use crate::core::{Clock, Result};
use crate::remote::{Fields, RemoteDataGateway};
use crate::retry::{RetryPolicy, retry_with_backoff, with_timeout};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{Level, event};
use uuid::Uuid;

/// Field carrying the per-probe token.
pub const PROBE_TOKEN_FIELD: &str = "probeToken";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Write and read-back confirmed.
    Full,
    /// Identity obtained, remote access unconfirmed.
    Partial,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Partial => f.write_str("partial"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub level: ValidationLevel,
    pub write_confirmed: bool,
    pub read_confirmed: bool,
    /// The probe record was deleted again.
    pub cleaned_up: bool,
    pub detail: Option<String>,
}

impl ValidationReport {
    fn partial(write_confirmed: bool, detail: String) -> Self {
        Self {
            level: ValidationLevel::Partial,
            write_confirmed,
            read_confirmed: false,
            cleaned_up: false,
            detail: Some(detail),
        }
    }
}

/// Write, read back and delete an ephemeral record under a candidate identity.
pub struct ValidationProbe {
    gateway: Arc<dyn RemoteDataGateway>,
    collections: RemoteCollections,
    policy: RecoveryPolicy,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ValidationProbe {
    pub fn new(gateway: Arc<dyn RemoteDataGateway>, config: &IdentityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            gateway,
            collections: config.collections.clone(),
            policy: config.recovery.clone(),
            retry: config.retry.clone(),
            clock,
        }
    }

    /// Never fails; remote errors downgrade the result to partial. The write,
    /// every poll and the cleanup share one `validation_timeout_ms` deadline.
    pub async fn validate(&self, identity: &str) -> ValidationReport {
        let deadline = Instant::now() + Duration::from_millis(self.policy.validation_timeout_ms);
        let token = Uuid::new_v4().simple().to_string();
        let probe_id = format!("{}_{}", identity, token);
        let collection = &self.collections.probes;

        let mut fields = Fields::new();
        fields.insert(self.collections.owner_field.clone(), json!(identity));
        fields.insert(PROBE_TOKEN_FIELD.to_string(), json!(token));
        fields.insert(
            "writtenAt".to_string(),
            json!(self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        let written = with_timeout(
            remaining(deadline),
            "validation write",
            retry_with_backoff(&self.retry, "validation write", || {
                self.gateway.upsert(collection, &probe_id, fields.clone())
            }),
        )
        .await;
        if let Err(err) = written {
            event!(Level::WARN, identity, error = %err, "validation write failed");
            return ValidationReport::partial(false, format!("validation write failed: {}", err));
        }

        let token_value = json!(token);
        let read_back = match self.poll_for(collection, &token_value, deadline).await {
            Ok(found) => found,
            Err(err) => {
                event!(Level::WARN, identity, error = %err, "validation read failed");
                false
            }
        };

        let cleanup = with_timeout(
            remaining(deadline),
            "validation cleanup",
            self.gateway.delete(collection, &probe_id),
        )
        .await;
        let cleaned_up = match cleanup {
            Ok(()) => true,
            Err(err) => {
                event!(Level::WARN, identity, record = %probe_id, error = %err, "validation record left behind");
                false
            }
        };

        if !read_back {
            return ValidationReport {
                cleaned_up,
                ..ValidationReport::partial(true, "validation write never became readable".to_string())
            };
        }

        event!(Level::DEBUG, identity, "validation round-trip confirmed");
        ValidationReport {
            level: ValidationLevel::Full,
            write_confirmed: true,
            read_confirmed: true,
            cleaned_up,
            detail: None,
        }
    }

    /// Polls until the record is visible or `deadline` passes.
    async fn poll_for(&self, collection: &str, token: &Value, deadline: Instant) -> Result<bool> {
        let interval = Duration::from_millis(self.policy.validation_poll_interval_ms.max(1));
        loop {
            let docs = with_timeout(
                remaining(deadline),
                "validation read",
                self.gateway.query(collection, PROBE_TOKEN_FIELD, token, 1),
            )
            .await?;
            if !docs.is_empty() {
                return Ok(true);
            }
            if Instant::now() + interval > deadline {
                return Ok(false);
            }
            sleep(interval).await;
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
