//! Coordination logic layered on the batch store.
//!
//! ## Design
//!
//! - Workers coordinate only through the store; nothing here holds state of
//!   its own
//! - Partition dispatch planning honors the fixed-once plan size and skips
//!   partitions that already completed on a previous run
//! - Partition recovery records outcomes only: detecting an unreachable
//!   owner is a collaborator's job (liveness is deployment policy)
//!
//! ## Components
//!
//! - [`PartitionPlanner`]: restart-skip dispatch planning for partitioned
//!   steps
//! - [`RecoveryService`]: cross-worker partition recovery plus worker-boot
//!   recovery of locally stranded work

pub mod planner;
pub mod recovery;

pub use planner::{DispatchPlan, PartitionMapper, PartitionPlanner};
pub use recovery::{RecoveryService, RECOVERED_EXIT_STATUS};
