use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short deterministic hash over device characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the session identity came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginMethod {
    Generated,
    RecoveredStorage,
    RecoveredFingerprintVerified,
    RecoveredDeviceSignature,
    Migrated,
}

impl OriginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::RecoveredStorage => "recovered_storage",
            Self::RecoveredFingerprintVerified => "recovered_fingerprint_verified",
            Self::RecoveredDeviceSignature => "recovered_device_signature",
            Self::Migrated => "migrated",
        }
    }
}

impl fmt::Display for OriginMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pseudonymous per-device key that partitions all remote data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    /// Unix epoch when the creation time could not be recovered.
    pub created_at: DateTime<Utc>,
    pub origin_method: OriginMethod,
    /// False when no backend accepted the identity and it only lives for this session.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

impl Identity {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, origin_method: OriginMethod) -> Self {
        Self {
            id: id.into(),
            created_at,
            origin_method,
            persistent: true,
        }
    }

    /// Returns a copy carrying a different origin, used when recovery confirms an identity.
    pub fn with_origin(mut self, origin_method: OriginMethod) -> Self {
        self.origin_method = origin_method;
        self
    }

    pub fn session_only(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn is_recovered(&self) -> bool {
        matches!(
            self.origin_method,
            OriginMethod::RecoveredStorage
                | OriginMethod::RecoveredFingerprintVerified
                | OriginMethod::RecoveredDeviceSignature
        )
    }
}
