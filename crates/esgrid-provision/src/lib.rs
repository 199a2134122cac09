//! esgrid-provision — master node, worker fleet, and launch sequencing.
//!
//! Everything that talks to a cloud provider goes through the
//! [`CloudProvider`] trait, so the pipeline runs unchanged against EC2
//! (`aws` feature) or the in-memory [`RecordingProvider`].
//!
//! # Architecture
//!
//! ```text
//! LaunchSequencer (one experiment at a time)
//!   ├── ImageResolver          (esgrid-core)
//!   ├── master_script          (esgrid-script)
//!   ├── MasterProvisioner      on-demand | spot + fulfillment poll, tags
//!   ├── worker_script          (needs master private address)
//!   └── FleetProvisioner       launch configuration + scaling group
//! ```
//!
//! There is no rollback: if the fleet cannot be created the master keeps
//! running and the failure is reported with the step that failed.

#[cfg(feature = "aws")]
pub mod aws;
pub mod fleet;
pub mod master;
pub mod provider;
pub mod recording;
pub mod sequencer;

#[cfg(feature = "aws")]
pub use aws::AwsProvider;
pub use fleet::FleetProvisioner;
pub use master::{MasterProvisioner, WaitSettings};
pub use provider::{
    Ack, CloudProvider, InstanceHandle, InstanceSpec, LaunchConfigurationRequest, ProviderError,
    ProviderResult, ScalingGroupRequest, SpotRequest, SpotRequestState,
};
pub use recording::{ProviderCall, RecordingBehavior, RecordingProvider};
pub use sequencer::{
    BatchPolicy, BatchReport, ExperimentFailure, LaunchObserver, LaunchSequencer, SilentObserver,
};
