//! Storage layer for the batch execution registry.
//!
//! ## Design
//!
//! - One storage interface for every deployment; the in-memory backing here
//!   and any durable backing implement the same trait
//! - Cross-worker coordination is expressed purely as store operations:
//!   conditional claims, composite-key uniqueness, atomic execution
//!   numbering with transparent retry on a lost race
//! - Entity generations are probed once per opened store and cached in a
//!   [`SchemaCatalog`]; reads never guess a record's shape
//! - Failed operations leave prior state untouched
//!
//! ## Components
//!
//! - [`BatchStore`]: the storage interface
//! - [`InMemoryBatchStore`]: synchronized in-memory backing for tests and
//!   non-persistent deployments
//! - [`SchemaCatalog`]: active entity generations for one opened store
//! - [`StoreError`]: the store-level error taxonomy

pub mod error;
pub mod in_memory;
pub mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use in_memory::InMemoryBatchStore;
pub use schema::SchemaCatalog;
pub use store::{
    BatchStore, ClaimOutcome, NewJobInstance, PartitionStepView, StepExecutionAggregate,
    StepExecutionUpdate, WorkerLocation,
};
