//! The batch store abstraction.
//!
//! One interface for every deployment: durable stores and the in-memory
//! backing implement the same trait, so coordination logic and tests swap
//! implementations freely. Cross-worker coordination is expressed entirely
//! through these operations — conditional writes, uniqueness on composite
//! keys, and atomic execution numbering.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use forgebatch_core::{JobExecutionId, JobInstanceId, StepExecutionId, WorkerId};
use forgebatch_model::{
    InstanceState, JobExecution, JobInstance, JobParameters, PartitionKey, PartitionState,
    RemotablePartition, RunStatus, StepMetrics, StepThreadExecution, StepThreadInstance,
    StepThreadKey,
};

use crate::error::StoreResult;

/// Where a worker can be reached: its cluster identity plus the callback
/// URL peers use to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLocation {
    pub worker_id: WorkerId,
    pub rest_url: String,
}

impl WorkerLocation {
    pub fn new(worker_id: impl Into<WorkerId>, rest_url: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            rest_url: rest_url.into(),
        }
    }
}

/// Fields captured when a job is submitted.
#[derive(Debug, Clone, Default)]
pub struct NewJobInstance {
    pub job_name: String,
    pub submitter: String,
    /// The job definition blob (XML), when captured at submission.
    pub job_definition: Option<String>,
    pub app_name: Option<String>,
}

impl NewJobInstance {
    pub fn new(job_name: impl Into<String>, submitter: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            submitter: submitter.into(),
            ..Self::default()
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.job_definition = Some(definition.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This call took ownership.
    Claimed(JobExecution),
    /// The same worker already owned the execution; nothing changed.
    AlreadyOwned(JobExecution),
}

impl ClaimOutcome {
    pub fn execution(&self) -> &JobExecution {
        match self {
            ClaimOutcome::Claimed(exec) | ClaimOutcome::AlreadyOwned(exec) => exec,
        }
    }
}

/// Snapshot of a running step thread execution, flushed by the worker
/// driving it.
///
/// Counters must be monotonic successors of the stored row; the store
/// rejects a snapshot that would decrease any counter.
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecutionUpdate {
    pub id: StepExecutionId,
    pub run_status: RunStatus,
    pub exit_status: Option<String>,
    pub metrics: StepMetrics,
    pub persistent_user_data: Option<Vec<u8>>,
}

/// One partition row of an aggregate view, with its remotable partition
/// record when the store carries them.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStepView {
    pub execution: StepThreadExecution,
    pub remotable: Option<RemotablePartition>,
}

/// A top-level step thread execution together with all of its partition
/// rows, partition number ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecutionAggregate {
    pub top_level: StepThreadExecution,
    pub partitions: Vec<PartitionStepView>,
}

/// The batch store: durable record-keeping for job instances, executions,
/// step threads, and remotable partitions.
///
/// Every operation is atomic at the granularity of one record. Failed
/// operations leave prior state untouched. The only transparent retry is
/// execution-number assignment inside [`BatchStore::create_job_execution`].
pub trait BatchStore: Send + Sync {
    // ---- job instances ----

    /// Create a job instance for a fresh submission.
    fn create_job_instance(
        &self,
        new_instance: NewJobInstance,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    fn job_instance(&self, id: JobInstanceId) -> StoreResult<JobInstance>;

    /// The owning instance of a job execution.
    fn job_instance_for_execution(&self, id: JobExecutionId) -> StoreResult<JobInstance>;

    /// Instances for a job name, newest first, paged.
    fn job_instances_by_name(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> StoreResult<Vec<JobInstance>>;

    /// Every distinct job name in the store.
    fn job_names(&self) -> StoreResult<BTreeSet<String>>;

    /// Number of instances for a job name, optionally narrowed to one
    /// submitter.
    fn job_instance_count(
        &self,
        job_name: &str,
        submitter: Option<&str>,
    ) -> StoreResult<usize>;

    fn update_instance_state(
        &self,
        id: JobInstanceId,
        state: InstanceState,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    fn update_instance_state_and_status(
        &self,
        id: JobInstanceId,
        state: InstanceState,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    /// Resubmit a stopped/failed instance for a restart execution.
    /// Conditional: fails with `NotRestartable` if the instance is still in
    /// a non-final state.
    fn mark_instance_resubmitted(
        &self,
        id: JobInstanceId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    /// Set (or clear, with `None`) the step a restart should resume from.
    fn set_instance_restart_step(
        &self,
        id: JobInstanceId,
        restart_on: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    /// Replace the resolved job name and definition blob (resolution can
    /// complete only after submission).
    fn update_instance_job_definition(
        &self,
        id: JobInstanceId,
        job_name: String,
        job_definition: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    /// Attach group/authorization names. Requires a store carrying the V3
    /// instance shape; fails with a configuration error otherwise.
    fn set_instance_group_names(
        &self,
        id: JobInstanceId,
        group_names: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance>;

    /// Remove an instance and every record reachable from it. Administrative.
    fn purge_job_instance(&self, id: JobInstanceId) -> StoreResult<()>;

    // ---- job executions ----

    /// Create the next execution for an instance.
    ///
    /// The execution number is the instance's current maximum plus one
    /// (starting at 1), assigned atomically; a lost race is retried
    /// transparently with a fresh read.
    fn create_job_execution(
        &self,
        instance_id: JobInstanceId,
        parameters: JobParameters,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    fn job_execution(&self, id: JobExecutionId) -> StoreResult<JobExecution>;

    /// Fetch an execution by its position within the instance.
    fn job_execution_by_number(
        &self,
        instance_id: JobInstanceId,
        execution_number: u32,
    ) -> StoreResult<JobExecution>;

    /// All executions of an instance, most recent first.
    fn job_executions_for_instance(
        &self,
        instance_id: JobInstanceId,
    ) -> StoreResult<Vec<JobExecution>>;

    /// Executions owned by a worker in any of the given statuses.
    fn job_executions_for_worker(
        &self,
        worker: &WorkerId,
        statuses: &[RunStatus],
    ) -> StoreResult<Vec<JobExecution>>;

    /// Executions of a job name in any of the given statuses.
    fn job_executions_for_job_name(
        &self,
        job_name: &str,
        statuses: &[RunStatus],
    ) -> StoreResult<Vec<JobExecution>>;

    /// Take ownership of a queued execution.
    ///
    /// Conditional write: claiming an execution this worker already owns is
    /// an idempotent no-op; claiming one owned by another worker fails with
    /// `AssignedToWorker`; claiming one that was stopped (or otherwise
    /// finished) before pickup fails with `NotClaimable`.
    fn claim_job_execution(
        &self,
        id: JobExecutionId,
        location: &WorkerLocation,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// Record the claimed execution actually running; the owning instance
    /// moves to dispatched/started alongside.
    fn mark_execution_started(
        &self,
        id: JobExecutionId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    /// Apply a run-status transition, mirroring it onto the instance's
    /// denormalized copy.
    fn update_execution_status(
        &self,
        id: JobExecutionId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    /// Stop an execution no worker has claimed yet.
    ///
    /// Conditional on the owner field still being unset; fails with
    /// `AssignedToWorker` once a worker owns it (the owner must honor the
    /// stop instead).
    fn stop_unclaimed_execution(
        &self,
        id: JobExecutionId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    /// Drive an execution to a terminal status, folding the outcome into
    /// the owning instance.
    fn finish_job_execution(
        &self,
        id: JobExecutionId,
        status: RunStatus,
        exit_status: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    fn set_execution_log_dir(
        &self,
        id: JobExecutionId,
        log_dir: String,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution>;

    // ---- step thread instances and executions ----

    /// Fetch a step thread instance, or `None` if this step/partition never
    /// ran for the instance.
    fn step_thread_instance(
        &self,
        key: &StepThreadKey,
    ) -> StoreResult<Option<StepThreadInstance>>;

    /// First run of a step: create the top-level thread instance and its
    /// first execution together. Fails with `DuplicateKey` if the step
    /// already ran under this job instance.
    fn create_top_level_step(
        &self,
        job_execution: JobExecutionId,
        key: StepThreadKey,
        partitioned: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// First run of a partition: create the partition thread instance and
    /// its first execution. With a `dispatcher` location, the matching
    /// remotable partition record (if any) is linked and marked dispatched.
    fn create_partition_step(
        &self,
        job_execution: JobExecutionId,
        key: StepThreadKey,
        dispatcher: Option<&WorkerLocation>,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// Restart of a top-level step thread: new execution in `Starting`,
    /// persisted user data carried over, start count incremented.
    fn restart_top_level_step(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// Restart of a top-level step thread that chose to begin over: no user
    /// data carried, checkpoint data deleted, start count still incremented.
    fn restart_top_level_step_clean(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// Restart of a partition thread: new execution with user data carried
    /// over (partition rows have no start count).
    fn restart_partition_step(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        dispatcher: Option<&WorkerLocation>,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// Overwrite a step thread's checkpoint blob wholesale.
    fn write_checkpoint(
        &self,
        key: &StepThreadKey,
        data: Vec<u8>,
    ) -> StoreResult<StepThreadInstance>;

    /// Discard a step thread's checkpoint blob.
    fn clear_checkpoint(&self, key: &StepThreadKey) -> StoreResult<StepThreadInstance>;

    /// Fix the partition plan size on first dispatch. Re-fixing the same
    /// size is a no-op; a different size is a validation error.
    fn fix_partition_plan_size(
        &self,
        key: &StepThreadKey,
        plan_size: u32,
    ) -> StoreResult<StepThreadInstance>;

    /// Partition numbers of this step whose latest execution completed
    /// successfully, ascending. Restart planning skips these.
    fn completed_partition_numbers(&self, top_level: &StepThreadKey) -> StoreResult<Vec<u32>>;

    /// Drop the partition-level thread instances related to a top-level
    /// step (used when a restart begins the step over from scratch).
    fn delete_partition_step_instances(&self, top_level: &StepThreadKey) -> StoreResult<()>;

    fn step_execution(&self, id: StepExecutionId) -> StoreResult<StepThreadExecution>;

    /// Flush a worker-side snapshot of a running step execution.
    fn update_step_execution(
        &self,
        update: StepExecutionUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution>;

    /// Recompute a top-level execution's counters as the sum over its
    /// partition rows. Pure summation; no partition row is altered.
    fn aggregate_top_level_metrics(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<StepThreadExecution>;

    /// Top-level step executions of a job execution, by start time
    /// ascending.
    fn top_level_step_executions(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<StepThreadExecution>>;

    /// Step executions of a job execution still in a running status, for
    /// recovery processing.
    fn running_step_executions(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<StepThreadExecution>>;

    /// The aggregate view for a top-level step execution: itself plus all
    /// partition rows (ascending), each with its remotable partition record
    /// when the store carries them.
    fn step_execution_aggregate(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<StepExecutionAggregate>;

    /// Aggregate view addressed by (job execution, step name).
    fn step_execution_aggregate_for_execution(
        &self,
        job_execution: JobExecutionId,
        step_name: &str,
    ) -> StoreResult<StepExecutionAggregate>;

    // ---- remotable partitions ----

    /// Create a queued ownership record ahead of dispatching a partition.
    ///
    /// Returns `None` when the store predates remotable partition records.
    /// Fails with `DuplicateKey` while a live (non-recovered) record exists
    /// for the key.
    fn create_remotable_partition(
        &self,
        key: PartitionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RemotablePartition>>;

    /// Internal state of the most recent record for a key; `None` when no
    /// record exists (e.g. the dispatcher predates partition records).
    fn remotable_partition_state(
        &self,
        key: &PartitionKey,
    ) -> StoreResult<Option<PartitionState>>;

    /// One-way recovery write for a partition whose owner is presumed dead.
    /// Tolerant of double recovery: recovering an already-recovered key is
    /// a no-op.
    fn mark_partition_recovered(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<RemotablePartition>;

    /// Partition numbers ever recovered under a top-level step execution,
    /// ascending. Monotonic: once reported, always reported.
    fn recovered_partition_numbers(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<Vec<u32>>;

    /// All remotable partition records of a job execution (empty when the
    /// store predates them).
    fn remotable_partitions_for_execution(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<RemotablePartition>>;

    /// Live records currently dispatched to a worker, for recovery
    /// processing.
    fn remotable_partitions_for_worker(
        &self,
        worker: &WorkerId,
    ) -> StoreResult<Vec<RemotablePartition>>;

    fn set_partition_log_dir(
        &self,
        key: &PartitionKey,
        log_dir: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RemotablePartition>>;
}
