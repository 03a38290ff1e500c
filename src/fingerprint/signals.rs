use async_trait::async_trait;
use chrono::{Local, Offset};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Device characteristics that feed the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    HardwareConcurrency,
    ScreenGeometry,
    Platform,
    TimezoneOffset,
    GraphicsRenderer,
    AudioContext,
    Language,
}

impl Signal {
    /// Fingerprint input order. Changing it changes every fingerprint.
    pub const ORDERED: [Signal; 7] = [
        Signal::HardwareConcurrency,
        Signal::ScreenGeometry,
        Signal::Platform,
        Signal::TimezoneOffset,
        Signal::GraphicsRenderer,
        Signal::AudioContext,
        Signal::Language,
    ];

    /// Minimal set hashed when too few primary signals are available.
    pub const FALLBACK: [Signal; 3] = [Signal::Platform, Signal::Language, Signal::TimezoneOffset];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HardwareConcurrency => "hardware_concurrency",
            Self::ScreenGeometry => "screen_geometry",
            Self::Platform => "platform",
            Self::TimezoneOffset => "timezone_offset",
            Self::GraphicsRenderer => "graphics_renderer",
            Self::AudioContext => "audio_context",
            Self::Language => "language",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal source unavailable")]
    Unavailable,
    #[error("signal source failed: {0}")]
    Failed(String),
}

/// Best-effort reader of raw device signals.
///
/// Implementations may fail per signal; the fingerprint generator substitutes a
/// sentinel and keeps going.
#[async_trait]
pub trait SignalCollector: Send + Sync {
    async fn collect(&self, signal: Signal) -> std::result::Result<String, SignalError>;
}

/// Deterministic collector backed by a fixed table.
///
/// Missing entries report [`SignalError::Unavailable`].
#[derive(Debug, Default)]
pub struct StaticSignalCollector {
    values: HashMap<Signal, std::result::Result<String, SignalError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticSignalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plausible desktop browser.
    pub fn desktop() -> Self {
        Self::new()
            .with(Signal::HardwareConcurrency, "8")
            .with(Signal::ScreenGeometry, "1920x1080x24")
            .with(Signal::Platform, "MacIntel")
            .with(Signal::TimezoneOffset, "-120")
            .with(Signal::GraphicsRenderer, "ANGLE (Apple, Apple M1, OpenGL 4.1)")
            .with(Signal::AudioContext, "44100:2:max")
            .with(Signal::Language, "en-US")
    }

    pub fn with(mut self, signal: Signal, value: impl Into<String>) -> Self {
        self.values.insert(signal, Ok(value.into()));
        self
    }

    pub fn failing(mut self, signal: Signal, message: impl Into<String>) -> Self {
        self.values
            .insert(signal, Err(SignalError::Failed(message.into())));
        self
    }

    pub fn without(mut self, signal: Signal) -> Self {
        self.values.remove(&signal);
        self
    }

    /// Makes every `collect` call suspend first, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `collect` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalCollector for StaticSignalCollector {
    async fn collect(&self, signal: Signal) -> std::result::Result<String, SignalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.values
            .get(&signal)
            .cloned()
            .unwrap_or(Err(SignalError::Unavailable))
    }
}

/// Reads what a native host can offer; display, renderer and audio are unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSignalCollector;

#[async_trait]
impl SignalCollector for HostSignalCollector {
    async fn collect(&self, signal: Signal) -> std::result::Result<String, SignalError> {
        match signal {
            Signal::HardwareConcurrency => std::thread::available_parallelism()
                .map(|n| n.get().to_string())
                .map_err(|err| SignalError::Failed(err.to_string())),
            Signal::Platform => Ok(format!(
                "{}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            )),
            Signal::TimezoneOffset => {
                // Minutes west of UTC, matching the browser convention.
                let east_secs = Local::now().offset().fix().local_minus_utc();
                Ok((-(east_secs / 60)).to_string())
            }
            Signal::Language => std::env::var("LANG")
                .ok()
                .map(|lang| lang.split('.').next().unwrap_or_default().replace('_', "-"))
                .filter(|lang| !lang.is_empty())
                .ok_or(SignalError::Unavailable),
            Signal::ScreenGeometry | Signal::GraphicsRenderer | Signal::AudioContext => {
                Err(SignalError::Unavailable)
            }
        }
    }
}
