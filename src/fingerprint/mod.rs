//! Deterministic device fingerprint.
//!
//! Signals are collected through a [`SignalCollector`], joined in the fixed
//! order of [`Signal::ORDERED`] with [`SIGNAL_SEPARATOR`], and reduced with a
//! 32-bit rolling hash rendered in base 36. The result is stable for a fixed
//! device build and drifts when the underlying signals change. It carries no
//! uniqueness or secrecy guarantee.

pub mod signals;

pub use signals::{HostSignalCollector, Signal, SignalCollector, SignalError, StaticSignalCollector};

use crate::core::Fingerprint;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{Level, event};

pub const SIGNAL_SEPARATOR: &str = "|";

/// Stand-in for a signal that failed or is unavailable.
pub const SENTINEL: &str = "unavailable";

/// Leading tag of the degraded fallback input.
pub const FALLBACK_TAG: &str = "fallback";

/// Below this many real signals the fallback set is hashed instead.
pub const MIN_STABLE_SIGNALS: usize = 3;

/// Outcome of one fingerprint computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintReport {
    pub fingerprint: Fingerprint,
    /// Signals that produced a real value.
    pub available_signals: usize,
    /// True when the fallback set was used.
    pub degraded: bool,
}

pub struct FingerprintGenerator {
    collector: Arc<dyn SignalCollector>,
    computations: AtomicUsize,
}

impl FingerprintGenerator {
    pub fn new(collector: Arc<dyn SignalCollector>) -> Self {
        Self {
            collector,
            computations: AtomicUsize::new(0),
        }
    }

    pub async fn compute(&self) -> Fingerprint {
        self.compute_detailed().await.fingerprint
    }

    pub async fn compute_detailed(&self) -> FingerprintReport {
        self.computations.fetch_add(1, Ordering::SeqCst);

        let collected = join_all(Signal::ORDERED.iter().map(|signal| async move {
            let value = match self.collector.collect(*signal).await {
                Ok(value) if !value.trim().is_empty() => value,
                Ok(_) => SENTINEL.to_string(),
                Err(err) => {
                    event!(Level::DEBUG, signal = signal.name(), error = %err, "fingerprint signal degraded");
                    SENTINEL.to_string()
                }
            };
            (*signal, value)
        }))
        .await;

        let available_signals = collected
            .iter()
            .filter(|(_, value)| value != SENTINEL)
            .count();
        let degraded = available_signals < MIN_STABLE_SIGNALS;

        let input = if degraded {
            let mut parts = vec![FALLBACK_TAG.to_string()];
            for wanted in Signal::FALLBACK {
                if let Some((_, value)) = collected.iter().find(|(signal, _)| *signal == wanted) {
                    parts.push(value.clone());
                }
            }
            parts.join(SIGNAL_SEPARATOR)
        } else {
            collected
                .iter()
                .map(|(_, value)| value.as_str())
                .collect::<Vec<_>>()
                .join(SIGNAL_SEPARATOR)
        };

        let fingerprint = Fingerprint::new(rolling_hash(&input));
        event!(
            Level::DEBUG,
            fingerprint = %fingerprint,
            available_signals,
            degraded,
            "fingerprint computed"
        );

        FingerprintReport {
            fingerprint,
            available_signals,
            degraded,
        }
    }

    /// Number of computations run by this generator.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }
}

/// `h = h * 31 + unit` over UTF-16 code units with 32-bit signed wrap-around,
/// rendered as base 36 of the absolute value.
pub fn rolling_hash(input: &str) -> String {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    to_base36((hash as i64).unsigned_abs())
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_hash_known_values() {
        assert_eq!(rolling_hash(""), "0");
        assert_eq!(rolling_hash("a"), "2p");
        assert_eq!(rolling_hash("ab"), "2e9");
    }

    #[test]
    fn test_rolling_hash_wraps_and_stays_positive() {
        let long = "x".repeat(10_000);
        let hash = rolling_hash(&long);
        assert!(!hash.is_empty());
        assert!(hash.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(2_147_483_648), "zik0zk");
    }

    #[tokio::test]
    async fn test_degraded_when_signals_missing() {
        let collector = StaticSignalCollector::new().with(Signal::Platform, "Linux x86_64");
        let generator = FingerprintGenerator::new(Arc::new(collector));
        let report = generator.compute_detailed().await;
        assert!(report.degraded);
        assert_eq!(report.available_signals, 1);
        assert_eq!(
            report.fingerprint.as_str(),
            rolling_hash("fallback|Linux x86_64|unavailable|unavailable")
        );
    }
}
