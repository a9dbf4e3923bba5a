//! `forgebatch-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives for the batch execution
//! registry (no storage or coordination concerns): strongly-typed
//! identifiers, the domain error model, and field-length limits enforced
//! before anything reaches a store.

pub mod error;
pub mod id;
pub mod limits;

pub use error::{DomainError, DomainResult};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId, WorkerId};
pub use limits::{MAX_EXIT_STATUS_LEN, MAX_STEP_NAME_LEN};
