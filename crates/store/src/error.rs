//! Store error model.

use forgebatch_core::{DomainError, JobExecutionId, JobInstanceId, StepExecutionId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the batch store.
///
/// Key conflicts are surfaced as errors rather than retried: the caller
/// must re-read and decide. The one exception is execution-number
/// assignment, which the store retries transparently on a lost race.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("no job instance found for id = {0}")]
    NoSuchJobInstance(JobInstanceId),

    #[error("no job execution found for id = {0}")]
    NoSuchJobExecution(JobExecutionId),

    #[error("no step thread execution found for id = {0}")]
    NoSuchStepExecution(StepExecutionId),

    #[error("no step thread instance found for key = {0}")]
    NoSuchStepThreadInstance(String),

    #[error("no top-level step thread execution for step {step_name} under execution {job_execution}")]
    NoTopLevelStepExecution {
        job_execution: JobExecutionId,
        step_name: String,
    },

    #[error("no execution number {number} for instance {instance}")]
    NoSuchExecutionNumber {
        instance: JobInstanceId,
        number: u32,
    },

    #[error("no remotable partition record for key = {0}")]
    NoSuchRemotablePartition(String),

    /// A create would duplicate a composite key. The caller re-reads and
    /// decides; nothing was written.
    #[error("record already exists for key = {0}")]
    DuplicateKey(String),

    /// An optimistic update lost a race and the caller must re-read.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stop was requested for an execution a worker already owns; only
    /// the owner may drive it to a terminal status.
    #[error("job execution {0} is already assigned to a worker")]
    AssignedToWorker(JobExecutionId),

    /// A claim arrived for an execution that is no longer claimable
    /// (stopped or otherwise finished before any worker picked it up).
    #[error("job execution {0} is not claimable")]
    NotClaimable(JobExecutionId),

    /// A restart was requested for an instance not in a restartable state.
    #[error("job instance {0} cannot be restarted from a non-final state")]
    NotRestartable(JobInstanceId),

    /// Validation, state-machine, decode, or configuration failure from the
    /// domain layer.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    /// Whether this error is the loser's side of a key race (the caller
    /// should re-read and retry its decision).
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_) | StoreError::Conflict(_))
    }
}
