//! Entity model for the batch execution registry.
//!
//! ## Design
//!
//! - One durable identity per level: job instance → job execution → step
//!   thread instance → step thread execution, plus cross-worker remotable
//!   partition records
//! - Status machines are validated at the model layer; stores never write
//!   an illegal transition
//! - Versioned entity shapes are one struct per family with
//!   generation-gated optional fields, never parallel type hierarchies
//! - Opaque payloads (checkpoint data, persisted user data) are stored as
//!   raw bytes and decoded lazily by the step logic that owns them
//!
//! ## Components
//!
//! - [`JobInstance`]: durable identity of a submitted job
//! - [`JobExecution`]: one run attempt of a job instance
//! - [`StepThreadInstance`] / [`StepThreadExecution`]: restart-spanning step
//!   identity and its per-attempt records
//! - [`RemotablePartition`]: cross-worker partition ownership record
//! - [`StepMetrics`]: the eight per-step counters and their roll-up
//! - [`Generation`]: schema generation tags for rolling upgrades

pub mod execution;
pub mod generation;
pub mod instance;
pub mod metrics;
pub mod params;
pub mod partition;
pub mod status;
pub mod step;

pub use execution::JobExecution;
pub use generation::Generation;
pub use instance::JobInstance;
pub use metrics::StepMetrics;
pub use params::{JobParameters, SUBMITTER_JOB_ID_PARAM, SUBMITTER_JOB_NAME_PARAM};
pub use partition::{PartitionKey, PartitionState, RemotablePartition};
pub use status::{InstanceState, RunStatus};
pub use step::{
    PartitionNumber, StepThreadExecution, StepThreadInstance, StepThreadKey, TopLevelStepInfo,
    PLAN_SIZE_UNSET,
};
