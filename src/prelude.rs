//! Recommended imports grouped by role.
//!
//! `app` covers booting the subsystem and reading the identity.
//! `testing` gathers the in-memory doubles used to exercise it.

pub mod app {
    //! Surface for application code.
    pub use crate::{
        BootReport, IdScheme, Identity, IdentityConfig, IdentityError, IdentitySubsystem,
        LocalNamespace, ManualRecoveryPresenter, OriginMethod, RemoteDataGateway, Result,
        StorageBackend, StorageTier, spawn_loss_monitor,
    };
}

pub mod testing {
    //! Deterministic collaborators for tests and tooling.
    pub use crate::core::ManualClock;
    pub use crate::fingerprint::StaticSignalCollector;
    pub use crate::recovery::{RecordingPresenter, StaticSignatureIndex};
    pub use crate::remote::InMemoryGateway;
    pub use crate::storage::{InMemoryNamespace, MemoryBackend};
}
