//! Provider client abstraction library.
//!
//! Defines the contracts the workspace orchestrators consume: a compute/volume
//! provider and a private network-mesh provider. Long-running provider work is
//! modelled as async operations that callers wait on through bounded polling
//! (see [`wait::poll_until`]).

pub mod cloud;
pub mod compute;
pub mod error;
pub mod mesh;
pub mod mesh_client;
pub mod types;
pub mod wait;

#[cfg(test)]
mod test_server;

// When the `test-helpers` feature is enabled, include the in-memory fakes.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use cloud::CloudClient;
pub use compute::ComputeProvider;
pub use error::{ProviderError, Result};
pub use mesh::MeshProvider;
pub use mesh_client::MeshClient;
pub use types::{
    AsyncOp, AuthCredential, AuthCredentialRequest, CreateInstanceRequest, CreateVolumeRequest,
    Created, DeviceWait, Instance, InstanceStatus, MeshDevice, OpStatus, Volume,
};
pub use wait::{poll_until, PollPolicy};
