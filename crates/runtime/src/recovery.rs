//! Partition and worker recovery.
//!
//! Two distinct paths share the same store writes:
//!
//! - a liveness collaborator decides some *other* worker is unreachable and
//!   its dispatched partition must change hands ([`RecoveryService::recover_partition`]);
//! - a worker boots and drives whatever *it* stranded in a previous life to
//!   a terminal status before accepting new work
//!   ([`RecoveryService::recover_local_executions`]).
//!
//! Neither path implements detection: timeouts, heartbeats, and the call
//! to declare an owner dead are deployment policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use forgebatch_core::{JobExecutionId, WorkerId};
use forgebatch_model::status::RUNNING_STATUSES;
use forgebatch_model::{PartitionKey, RemotablePartition, RunStatus, StepThreadExecution, StepThreadKey};
use forgebatch_store::{BatchStore, StepExecutionUpdate, StoreResult, WorkerLocation};
use tracing::{info, warn};

/// Exit status recorded on work driven to `Failed` by recovery rather than
/// by its own logic.
pub const RECOVERED_EXIT_STATUS: &str = "RECOVERED";

/// Recovery operations for one worker process.
pub struct RecoveryService<S> {
    store: Arc<S>,
    location: WorkerLocation,
}

impl<S: BatchStore> RecoveryService<S> {
    pub fn new(store: Arc<S>, location: WorkerLocation) -> Self {
        Self { store, location }
    }

    pub fn location(&self) -> &WorkerLocation {
        &self.location
    }

    /// Reassign a partition whose owner is presumed dead.
    ///
    /// Marks the live ownership record recovered (a one-way write, tolerant
    /// of a racing recovery) and queues a fresh record for the same key.
    /// The prior step thread execution is left untouched as history; call
    /// [`RecoveryService::redispatch_partition`] on the worker taking the
    /// work to create the new attempt.
    pub fn recover_partition(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<RemotablePartition> {
        let superseded = self.store.mark_partition_recovered(key, now)?;
        warn!(key = %key, prior_owner = ?superseded.worker_id, "partition owner presumed dead");
        match self.store.create_remotable_partition(key.clone(), now) {
            Ok(Some(queued)) => Ok(queued),
            Ok(None) => Ok(superseded),
            // A racing recovery already queued the replacement record; its
            // write supersedes ours harmlessly.
            Err(err) if err.is_conflict() => Ok(superseded),
            Err(err) => Err(err),
        }
    }

    /// Take over a recovered partition on this worker: creates the new step
    /// thread execution (user data carried from the last attempt) and
    /// marks the queued ownership record dispatched here.
    pub fn redispatch_partition(
        &self,
        job_execution: JobExecutionId,
        step_key: &StepThreadKey,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        let execution =
            self.store
                .restart_partition_step(job_execution, step_key, Some(&self.location), now)?;
        info!(key = %step_key, worker = %self.location.worker_id, "recovered partition redispatched");
        Ok(execution)
    }

    /// Worker-boot recovery: every execution this worker owned that is
    /// still in a running status was stranded by a crash. Drive its running
    /// step threads and the execution itself to `Failed` so the instance
    /// becomes restartable. Returns the recovered execution ids.
    pub fn recover_local_executions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<JobExecutionId>> {
        let stranded = self
            .store
            .job_executions_for_worker(&self.location.worker_id, &RUNNING_STATUSES)?;
        let mut recovered = Vec::with_capacity(stranded.len());
        for execution in stranded {
            for step in self.store.running_step_executions(execution.id)? {
                self.store.update_step_execution(
                    StepExecutionUpdate {
                        id: step.id,
                        run_status: RunStatus::Failed,
                        exit_status: Some(RECOVERED_EXIT_STATUS.to_string()),
                        metrics: step.metrics,
                        persistent_user_data: step.persistent_user_data.clone(),
                    },
                    now,
                )?;
            }
            self.store.finish_job_execution(
                execution.id,
                RunStatus::Failed,
                Some(RECOVERED_EXIT_STATUS.to_string()),
                now,
            )?;
            warn!(execution = %execution.id, "stranded job execution recovered to FAILED");
            recovered.push(execution.id);
        }
        Ok(recovered)
    }

    /// Worker-boot recovery for partitions this worker was running remotely
    /// when it crashed: their ownership records are marked recovered so the
    /// coordinating step can redispatch them. Returns the superseded
    /// records.
    pub fn recover_local_partitions(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RemotablePartition>> {
        self.recover_partitions_owned_by(&self.location.worker_id, now)
    }

    /// Mark every partition currently dispatched to `worker` recovered.
    /// Used both at worker boot (for this worker's own prior life) and by
    /// the liveness collaborator when it declares a peer dead.
    pub fn recover_partitions_owned_by(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RemotablePartition>> {
        let owned = self.store.remotable_partitions_for_worker(worker)?;
        let mut superseded = Vec::with_capacity(owned.len());
        for record in owned {
            superseded.push(self.store.mark_partition_recovered(&record.key, now)?);
        }
        if !superseded.is_empty() {
            warn!(%worker, count = superseded.len(), "dispatched partitions recovered");
        }
        Ok(superseded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_model::{JobParameters, PartitionState, StepMetrics};
    use forgebatch_store::{InMemoryBatchStore, NewJobInstance};

    fn location(name: &str) -> WorkerLocation {
        WorkerLocation::new(name, format!("https://{name}:9443/batch"))
    }

    struct Fixture {
        store: Arc<InMemoryBatchStore>,
        instance: forgebatch_core::JobInstanceId,
        execution: JobExecutionId,
        top: StepThreadExecution,
    }

    fn partitioned_job() -> Fixture {
        let store = InMemoryBatchStore::arc();
        let instance = store
            .create_job_instance(NewJobInstance::new("nightly-load", "ops"), Utc::now())
            .unwrap();
        let execution = store
            .create_job_execution(instance.id, JobParameters::new(), Utc::now())
            .unwrap();
        store
            .claim_job_execution(execution.id, &location("worker-a"), Utc::now())
            .unwrap();
        store
            .mark_execution_started(execution.id, Utc::now())
            .unwrap();
        let top = store
            .create_top_level_step(
                execution.id,
                StepThreadKey::top_level(instance.id, "load"),
                true,
                Utc::now(),
            )
            .unwrap();
        Fixture {
            store,
            instance: instance.id,
            execution: execution.id,
            top,
        }
    }

    #[test]
    fn partition_changes_hands_and_history_survives() {
        let fixture = partitioned_job();
        let store = &fixture.store;

        // Partition 2 dispatched remotely to worker A.
        let partition_key = PartitionKey::new(fixture.execution, "load", 2);
        store
            .create_remotable_partition(partition_key.clone(), Utc::now())
            .unwrap();
        let step_key = StepThreadKey::partition(fixture.instance, "load", 2);
        let attempt_a = store
            .create_partition_step(
                fixture.execution,
                step_key.clone(),
                Some(&location("worker-a")),
                Utc::now(),
            )
            .unwrap();

        // Liveness collaborator declares worker A dead; worker B takes over.
        let on_b = RecoveryService::new(Arc::clone(store), location("worker-b"));
        let queued = on_b.recover_partition(&partition_key, Utc::now()).unwrap();
        assert_eq!(queued.state, PartitionState::Queued);
        let attempt_b = on_b
            .redispatch_partition(fixture.execution, &step_key, Utc::now())
            .unwrap();

        assert_eq!(
            store.recovered_partition_numbers(fixture.top.id).unwrap(),
            vec![2]
        );
        assert_eq!(
            store.remotable_partition_state(&partition_key).unwrap(),
            Some(PartitionState::Dispatched)
        );
        // Worker A's attempt is untouched history; B's attempt is live.
        let historical = store.step_execution(attempt_a.id).unwrap();
        assert_eq!(historical.run_status, attempt_a.run_status);
        assert_ne!(attempt_b.id, attempt_a.id);
    }

    #[test]
    fn redispatch_carries_user_data_forward() {
        let fixture = partitioned_job();
        let store = &fixture.store;

        let partition_key = PartitionKey::new(fixture.execution, "load", 0);
        store
            .create_remotable_partition(partition_key.clone(), Utc::now())
            .unwrap();
        let step_key = StepThreadKey::partition(fixture.instance, "load", 0);
        let attempt_a = store
            .create_partition_step(
                fixture.execution,
                step_key.clone(),
                Some(&location("worker-a")),
                Utc::now(),
            )
            .unwrap();
        store
            .update_step_execution(
                StepExecutionUpdate {
                    id: attempt_a.id,
                    run_status: RunStatus::Started,
                    exit_status: None,
                    metrics: StepMetrics::new(),
                    persistent_user_data: Some(b"cursor@42".to_vec()),
                },
                Utc::now(),
            )
            .unwrap();

        let on_b = RecoveryService::new(Arc::clone(store), location("worker-b"));
        on_b.recover_partition(&partition_key, Utc::now()).unwrap();
        let attempt_b = on_b
            .redispatch_partition(fixture.execution, &step_key, Utc::now())
            .unwrap();
        assert_eq!(
            attempt_b.persistent_user_data.as_deref(),
            Some(b"cursor@42".as_slice())
        );
    }

    #[test]
    fn worker_boot_fails_its_stranded_executions() {
        let fixture = partitioned_job();
        let store = &fixture.store;

        // The job execution and its top-level step are in flight on
        // worker A when it dies and comes back.
        let on_a = RecoveryService::new(Arc::clone(store), location("worker-a"));
        let recovered = on_a.recover_local_executions(Utc::now()).unwrap();
        assert_eq!(recovered, vec![fixture.execution]);

        let execution = store.job_execution(fixture.execution).unwrap();
        assert_eq!(execution.run_status, RunStatus::Failed);
        assert_eq!(execution.exit_status.as_deref(), Some(RECOVERED_EXIT_STATUS));

        let step = store.step_execution(fixture.top.id).unwrap();
        assert_eq!(step.run_status, RunStatus::Failed);

        // The instance is now restartable.
        let instance = store.job_instance(fixture.instance).unwrap();
        assert!(instance.instance_state.is_restartable());

        // A second boot finds nothing left to recover.
        assert!(on_a.recover_local_executions(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn worker_boot_recovers_its_dispatched_partitions() {
        let fixture = partitioned_job();
        let store = &fixture.store;

        let partition_key = PartitionKey::new(fixture.execution, "load", 1);
        store
            .create_remotable_partition(partition_key.clone(), Utc::now())
            .unwrap();
        let step_key = StepThreadKey::partition(fixture.instance, "load", 1);
        store
            .create_partition_step(
                fixture.execution,
                step_key,
                Some(&location("worker-a")),
                Utc::now(),
            )
            .unwrap();

        let on_a = RecoveryService::new(Arc::clone(store), location("worker-a"));
        let superseded = on_a.recover_local_partitions(Utc::now()).unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(
            store.remotable_partition_state(&partition_key).unwrap(),
            Some(PartitionState::Recovered)
        );
        assert_eq!(
            store.recovered_partition_numbers(fixture.top.id).unwrap(),
            vec![1]
        );
    }
}
