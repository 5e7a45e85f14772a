//! Workspace lifecycle orchestration
//!
//! This crate owns the workspace database and the two state machines that
//! move workspaces between states: [`Provisioner`] and [`Destroyer`]. Both are
//! driven by jobs from `ws-queue` and talk to the outside world only through
//! the `ws-provider` traits and a [`CredentialStore`].

pub mod boot;
pub mod credentials;
pub mod db;
pub mod destroy;
pub mod error;
pub mod provision;
pub mod resources;
pub mod settings;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use credentials::{
    AesGcmCipher, CaptureToken, CredentialCipher, CredentialStore, SqlCredentialStore,
};
pub use destroy::{DestroyOutcome, Destroyer};
pub use error::{OrchestratorError, Result};
pub use provision::{ProvisionOutcome, Provisioner};
pub use resources::{InstanceStatus, VolumeStatus, WorkspaceInstance, WorkspaceVolume};
pub use settings::ProvisionSettings;
pub use workspace::{
    CreateWorkspaceRequest, Workspace, WorkspaceDetail, WorkspaceFilters, WorkspaceStatus,
    WorkspaceStore,
};
