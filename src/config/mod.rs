use crate::core::{IdentityError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How a brand-new identity is minted when no backend holds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// `fp_<fingerprint>`: the same device regenerates the same id.
    #[default]
    Fingerprint,
    /// `user_<uuid>`: unique per mint, only recoverable from storage.
    Random,
}

/// Local storage keys owned by the subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityKeys {
    /// Canonical identity key, written by the identity store only.
    pub identity: String,
    /// Companion key holding the identity creation time (RFC 3339).
    pub created_at: String,
    /// First-visit breadcrumb, written alongside the identity.
    pub breadcrumb: String,
    /// Namespace key holding the visitor's display name.
    pub display_name: String,
}

impl Default for IdentityKeys {
    fn default() -> Self {
        Self {
            identity: "device_user_id".to_string(),
            created_at: "device_user_id_created".to_string(),
            breadcrumb: "device_visit_breadcrumb".to_string(),
            display_name: "userName".to_string(),
        }
    }
}

/// Remote collections, all partitioned by a `userId` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCollections {
    pub saved_items: String,
    pub watch_progress: String,
    /// Scratch collection for validation probes.
    pub probes: String,
    /// Field every partitioned document carries.
    pub owner_field: String,
}

impl Default for RemoteCollections {
    fn default() -> Self {
        Self {
            saved_items: "saved_items".to_string(),
            watch_progress: "watch_progress".to_string(),
            probes: "identity_probes".to_string(),
            owner_field: "userId".to_string(),
        }
    }
}

/// Tuning for the data-loss heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorPolicy {
    /// An identity younger than this looks freshly minted.
    pub fresh_identity_window_secs: i64,
    /// A namespace with at most this many keys counts as nearly empty.
    pub nearly_empty_max_keys: usize,
    /// Display names treated as "no name".
    pub default_display_names: Vec<String>,
    /// Upper bound for the remote saved-items lookup.
    pub remote_timeout_ms: u64,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            fresh_identity_window_secs: 60,
            nearly_empty_max_keys: 2,
            default_display_names: vec!["Guest".to_string(), "Anonymous".to_string()],
            remote_timeout_ms: 3_000,
        }
    }
}

/// Tuning for the recovery cascade and post-recovery validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Ceiling on strategy attempts across one run.
    pub max_attempts: u32,
    /// Upper bound for fingerprint verification against the remote store.
    pub verification_timeout_ms: u64,
    /// Upper bound for the whole validation probe.
    pub validation_timeout_ms: u64,
    /// Delay between read-back polls during validation.
    pub validation_poll_interval_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            verification_timeout_ms: 5_000,
            validation_timeout_ms: 5_000,
            validation_poll_interval_ms: 100,
        }
    }
}

/// Tuning for the legacy-data migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationPolicy {
    /// Version gate; a completion marker is written per version.
    pub version: u32,
    pub legacy_identity_key: String,
    pub legacy_saved_items_key: String,
    pub legacy_progress_key: String,
    /// Additional legacy keys that are only scheduled for deletion.
    pub legacy_extra_keys: Vec<String>,
    /// Operations per remote batch write.
    pub batch_size: usize,
    /// Days a migrated legacy key survives before `purge_expired` removes it.
    pub grace_period_days: i64,
    pub marker_key_prefix: String,
    pub backup_key_prefix: String,
    pub pending_deletion_key: String,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            version: 2,
            legacy_identity_key: "userId".to_string(),
            legacy_saved_items_key: "savedItems".to_string(),
            legacy_progress_key: "watchProgress".to_string(),
            legacy_extra_keys: Vec::new(),
            batch_size: 400,
            grace_period_days: 30,
            marker_key_prefix: "__identity_migration_v".to_string(),
            backup_key_prefix: "__identity_migration_backup_v".to_string(),
            pending_deletion_key: "__identity_pending_deletion".to_string(),
        }
    }
}

impl MigrationPolicy {
    pub fn marker_key(&self) -> String {
        format!("{}{}", self.marker_key_prefix, self.version)
    }

    pub fn backup_key(&self) -> String {
        format!("{}{}", self.backup_key_prefix, self.version)
    }

    /// Every legacy key the migration consumes or schedules for deletion.
    pub fn legacy_keys(&self) -> Vec<String> {
        let mut keys = vec![
            self.legacy_identity_key.clone(),
            self.legacy_saved_items_key.clone(),
            self.legacy_progress_key.clone(),
        ];
        keys.extend(self.legacy_extra_keys.iter().cloned());
        keys
    }
}

/// Subsystem configuration
///
/// Every section has defaults, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IdentityConfig {
    pub keys: IdentityKeys,
    pub id_scheme: IdScheme,
    pub collections: RemoteCollections,
    pub retry: RetryPolicy,
    pub detector: DetectorPolicy,
    pub recovery: RecoveryPolicy,
    pub migration: MigrationPolicy,
}

impl IdentityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the id scheme used for newly minted identities
    pub fn id_scheme(mut self, scheme: IdScheme) -> Self {
        self.id_scheme = scheme;
        self
    }

    /// Set the canonical identity key
    pub fn identity_key(mut self, key: &str) -> Self {
        self.keys.identity = key.to_string();
        self
    }

    /// Set the retry policy for remote calls
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the freshness window of the `newUserId` indicator
    pub fn fresh_identity_window(mut self, window: Duration) -> Self {
        self.detector.fresh_identity_window_secs = window.as_secs() as i64;
        self
    }

    /// Set the recovery attempt ceiling
    pub fn max_recovery_attempts(mut self, max: u32) -> Self {
        self.recovery.max_attempts = max;
        self
    }

    /// Set the validation probe timeout
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.recovery.validation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the migration version gate
    pub fn migration_version(mut self, version: u32) -> Self {
        self.migration.version = version;
        self
    }

    /// Set the migration batch size
    pub fn migration_batch_size(mut self, size: usize) -> Self {
        self.migration.batch_size = size;
        self
    }

    /// Parse from a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let keys = [
            &self.keys.identity,
            &self.keys.created_at,
            &self.keys.breadcrumb,
            &self.keys.display_name,
        ];
        if keys.iter().any(|key| key.trim().is_empty()) {
            return Err(IdentityError::Config("storage keys cannot be empty".into()));
        }

        if self.keys.identity == self.keys.created_at || self.keys.identity == self.keys.breadcrumb {
            return Err(IdentityError::Config(
                "identity key must differ from its companion keys".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(IdentityError::Config("retry.max_attempts must be > 0".into()));
        }

        if self.recovery.max_attempts == 0 {
            return Err(IdentityError::Config("recovery.max_attempts must be > 0".into()));
        }

        if self.recovery.validation_poll_interval_ms == 0 {
            return Err(IdentityError::Config(
                "recovery.validation_poll_interval_ms must be > 0".into(),
            ));
        }

        if self.migration.batch_size == 0 {
            return Err(IdentityError::Config("migration.batch_size must be > 0".into()));
        }

        if self.migration.grace_period_days < 0 {
            return Err(IdentityError::Config(
                "migration.grace_period_days cannot be negative".into(),
            ));
        }

        if self.migration.legacy_keys().contains(&self.keys.identity) {
            return Err(IdentityError::Config(
                "legacy keys cannot include the canonical identity key".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IdentityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.id_scheme, IdScheme::Fingerprint);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.migration.marker_key(), "__identity_migration_v2");
    }

    #[test]
    fn test_builder_pattern() {
        let config = IdentityConfig::new()
            .id_scheme(IdScheme::Random)
            .identity_key("uid")
            .max_recovery_attempts(2)
            .migration_batch_size(10);

        assert_eq!(config.id_scheme, IdScheme::Random);
        assert_eq!(config.keys.identity, "uid");
        assert_eq!(config.recovery.max_attempts, 2);
        assert_eq!(config.migration.batch_size, 10);
    }

    #[test]
    fn test_from_json_partial() {
        let config = IdentityConfig::from_json_str(
            r#"{"id_scheme":"random","migration":{"version":7}}"#,
        )
        .unwrap();
        assert_eq!(config.id_scheme, IdScheme::Random);
        assert_eq!(config.migration.version, 7);
        assert_eq!(config.migration.batch_size, 400);
        assert_eq!(config.keys.identity, "device_user_id");
    }

    #[test]
    fn test_validate() {
        assert!(IdentityConfig::new().identity_key("").validate().is_err());
        assert!(IdentityConfig::new().migration_batch_size(0).validate().is_err());
        assert!(IdentityConfig::new().max_recovery_attempts(0).validate().is_err());
        assert!(IdentityConfig::new().identity_key("userId").validate().is_err());
    }
}
