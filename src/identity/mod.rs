//! Resolution, caching and redundant persistence of the session identity.

pub mod store;

pub use store::{IdentityStore, PersistReport, StoredIdentity};

use crate::config::IdScheme;
use crate::core::Fingerprint;
use uuid::Uuid;

/// Prefix of identities derived from a fingerprint.
pub const FINGERPRINT_ID_PREFIX: &str = "fp_";

/// Prefix of randomly minted identities.
pub const RANDOM_ID_PREFIX: &str = "user_";

/// The identity a device regenerates from its fingerprint alone.
pub fn fingerprint_identity_id(fingerprint: &Fingerprint) -> String {
    format!("{}{}", FINGERPRINT_ID_PREFIX, fingerprint)
}

/// Mints an id for a visitor with no stored identity.
pub fn mint_identity_id(scheme: IdScheme, fingerprint: &Fingerprint) -> String {
    match scheme {
        IdScheme::Fingerprint => fingerprint_identity_id(fingerprint),
        IdScheme::Random => format!("{}{}", RANDOM_ID_PREFIX, Uuid::new_v4().simple()),
    }
}

/// Whether `id` has the shape current code mints.
pub fn is_current_format(id: &str) -> bool {
    let valid_tail = |tail: &str| {
        !tail.is_empty() && tail.chars().all(|c| c.is_ascii_alphanumeric())
    };
    id.strip_prefix(FINGERPRINT_ID_PREFIX).is_some_and(valid_tail)
        || id.strip_prefix(RANDOM_ID_PREFIX).is_some_and(valid_tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_scheme_is_deterministic() {
        let fp = Fingerprint::new("1x2y3z");
        assert_eq!(mint_identity_id(IdScheme::Fingerprint, &fp), "fp_1x2y3z");
        assert_eq!(
            mint_identity_id(IdScheme::Fingerprint, &fp),
            mint_identity_id(IdScheme::Fingerprint, &fp)
        );
    }

    #[test]
    fn test_random_scheme_is_unique() {
        let fp = Fingerprint::new("abc");
        let a = mint_identity_id(IdScheme::Random, &fp);
        let b = mint_identity_id(IdScheme::Random, &fp);
        assert_ne!(a, b);
        assert!(is_current_format(&a));
    }

    #[test]
    fn test_current_format() {
        assert!(is_current_format("fp_abc123"));
        assert!(!is_current_format("fp_"));
        assert!(!is_current_format("1699999999999_k3j2h1"));
        assert!(!is_current_format("id_42"));
    }
}
