use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Storage error in {backend}: {message}")]
    Storage { backend: String, message: String },

    #[error("Storage backend '{0}' did not answer in time")]
    BackendTimeout(String),

    #[error("Identity unavailable: every storage backend rejected the write")]
    IdentityUnavailable,

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote permission denied: {0}")]
    RemotePermissionDenied(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Background task error: {0}")]
    Background(String),
}

impl IdentityError {
    pub fn storage(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable(_) | Self::Timeout(_) | Self::BackendTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

impl<T> From<std::sync::PoisonError<T>> for IdentityError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IdentityError::RemoteUnavailable("offline".into()).is_transient());
        assert!(IdentityError::Timeout("probe".into()).is_transient());
        assert!(!IdentityError::RemotePermissionDenied("rules".into()).is_transient());
        assert!(!IdentityError::IdentityUnavailable.is_transient());
    }

    #[test]
    fn test_storage_display() {
        let err = IdentityError::storage("header_store", "value too large");
        assert_eq!(
            err.to_string(),
            "Storage error in header_store: value too large"
        );
    }
}
