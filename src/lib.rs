// ============================================================================
// Device Identity Library
// ============================================================================

//! Stable pseudonymous identity for anonymous visitors whose local storage can
//! be cleared, partially cleared or raced by concurrent initialization.
//!
//! The identity is the partition key for everything a visitor stores
//! remotely. It is written redundantly to several [`storage::StorageBackend`]
//! tiers, repaired from whichever tier survived, scored for apparent loss and
//! recovered through a cascade of strategies when needed.
//!
//! # Examples
//!
//! ```
//! use device_identity::{
//!     IdentitySubsystem, InMemoryGateway, InMemoryNamespace, MemoryBackend, OriginMethod,
//!     StaticSignalCollector,
//! };
//! use std::sync::Arc;
//!
//! tokio_test::block_on(async {
//!     let subsystem = IdentitySubsystem::builder()
//!         .backend(Arc::new(MemoryBackend::page_cache()))
//!         .backend(Arc::new(MemoryBackend::session_cache()))
//!         .gateway(Arc::new(InMemoryGateway::new()))
//!         .namespace(Arc::new(InMemoryNamespace::new()))
//!         .signal_collector(Arc::new(StaticSignalCollector::desktop()))
//!         .build()
//!         .unwrap();
//!
//!     let boot = subsystem.ready().await;
//!     assert!(boot.identity.id.starts_with("fp_"));
//!     assert_eq!(boot.identity.origin_method, OriginMethod::Generated);
//!     assert_eq!(subsystem.identity().await, boot.identity);
//! });
//! ```

pub mod config;
pub mod core;
pub mod detector;
pub mod facade;
pub mod fingerprint;
pub mod identity;
pub mod migration;
pub mod prelude;
pub mod recovery;
pub mod remote;
pub mod retry;
pub mod storage;

pub use config::{IdScheme, IdentityConfig};
pub use core::{Clock, Fingerprint, Identity, IdentityError, ManualClock, OriginMethod, Result, SystemClock};
pub use detector::{DataLossDetector, LossIndicators, LossReport};
pub use facade::{BootReport, IdentitySubsystem, IdentitySubsystemBuilder, LossMonitor, spawn_loss_monitor};
pub use fingerprint::{FingerprintGenerator, HostSignalCollector, Signal, SignalCollector, StaticSignalCollector};
pub use identity::IdentityStore;
pub use migration::{MigrationManager, MigrationOutcome, MigrationRecord};
pub use recovery::{
    ManualRecoveryPresenter, RecoveryOrchestrator, RecoveryOutcome, RecoveryState, ValidationLevel,
};
pub use remote::{InMemoryGateway, RemoteDataGateway};
pub use retry::RetryPolicy;
pub use storage::{
    HeaderStoreBackend, InMemoryNamespace, JsonFileStore, LocalNamespace, MemoryBackend,
    StorageBackend, StorageTier, WorkerChannelBackend,
};
