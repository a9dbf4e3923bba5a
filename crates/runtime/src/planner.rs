//! Dispatch planning for partitioned steps.

use std::collections::BTreeSet;
use std::sync::Arc;

use forgebatch_core::StepExecutionId;
use forgebatch_model::StepThreadKey;
use forgebatch_store::{BatchStore, StoreError, StoreResult};
use tracing::{debug, info};

/// Step-specific logic that decides how many partitions a step splits into.
///
/// Consulted exactly once per step thread instance: the computed size is
/// fixed in the store on first dispatch and reread on every restart, so a
/// mapper that answers differently across restarts cannot reshape an
/// in-flight job.
pub trait PartitionMapper {
    fn compute_plan_size(&self) -> u32;
}

impl<F> PartitionMapper for F
where
    F: Fn() -> u32 + Send + Sync,
{
    fn compute_plan_size(&self) -> u32 {
        self()
    }
}

/// What one run of a partitioned top-level step should dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    /// The fixed partition count.
    pub plan_size: u32,
    /// Partitions whose latest execution completed successfully; not
    /// dispatched again.
    pub skip: BTreeSet<u32>,
    /// Partitions whose prior owner was presumed dead; step logic decides
    /// whether they resume from checkpoint or start over.
    pub recovered: BTreeSet<u32>,
    /// Partition numbers to (re)dispatch, ascending.
    pub dispatch: Vec<u32>,
}

/// Computes the dispatch plan for a partitioned step, on first run and on
/// restart.
pub struct PartitionPlanner<S> {
    store: Arc<S>,
}

impl<S: BatchStore> PartitionPlanner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Plan one run of the partitioned step owning `top_key`.
    ///
    /// The first run computes the plan size from the mapper and fixes it;
    /// restarts reread the stored size and skip partitions that already
    /// completed.
    pub fn plan(
        &self,
        top_key: &StepThreadKey,
        top_execution: StepExecutionId,
        mapper: &dyn PartitionMapper,
    ) -> StoreResult<DispatchPlan> {
        let instance = self
            .store
            .step_thread_instance(top_key)?
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(top_key.to_string()))?;

        let plan_size = match instance.plan_size() {
            Some(size) => size,
            None => {
                let size = mapper.compute_plan_size();
                self.store.fix_partition_plan_size(top_key, size)?;
                debug!(key = %top_key, size, "partition plan size fixed");
                size
            }
        };

        let skip: BTreeSet<u32> = self
            .store
            .completed_partition_numbers(top_key)?
            .into_iter()
            .collect();
        let recovered: BTreeSet<u32> = self
            .store
            .recovered_partition_numbers(top_execution)?
            .into_iter()
            .collect();
        let dispatch: Vec<u32> = (0..plan_size).filter(|n| !skip.contains(n)).collect();

        info!(
            key = %top_key,
            plan_size,
            skipped = skip.len(),
            dispatching = dispatch.len(),
            "partition dispatch planned"
        );
        Ok(DispatchPlan {
            plan_size,
            skip,
            recovered,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use forgebatch_model::{JobParameters, RunStatus, StepMetrics};
    use forgebatch_store::{InMemoryBatchStore, NewJobInstance, StepExecutionUpdate};

    struct Fixture {
        store: Arc<InMemoryBatchStore>,
        instance: forgebatch_core::JobInstanceId,
        execution: forgebatch_core::JobExecutionId,
        top: forgebatch_model::StepThreadExecution,
        top_key: StepThreadKey,
    }

    fn partitioned_step() -> Fixture {
        let store = InMemoryBatchStore::arc();
        let instance = store
            .create_job_instance(NewJobInstance::new("nightly-load", "ops"), Utc::now())
            .unwrap();
        let execution = store
            .create_job_execution(instance.id, JobParameters::new(), Utc::now())
            .unwrap();
        let top_key = StepThreadKey::top_level(instance.id, "load");
        let top = store
            .create_top_level_step(execution.id, top_key.clone(), true, Utc::now())
            .unwrap();
        Fixture {
            store,
            instance: instance.id,
            execution: execution.id,
            top,
            top_key,
        }
    }

    fn complete_partition(fixture: &Fixture, number: u32) {
        let key = StepThreadKey::partition(fixture.instance, "load", number);
        let row = fixture
            .store
            .create_partition_step(fixture.execution, key, None, Utc::now())
            .unwrap();
        fixture
            .store
            .update_step_execution(
                StepExecutionUpdate {
                    id: row.id,
                    run_status: RunStatus::Started,
                    exit_status: None,
                    metrics: StepMetrics::new(),
                    persistent_user_data: None,
                },
                Utc::now(),
            )
            .unwrap();
        fixture
            .store
            .update_step_execution(
                StepExecutionUpdate {
                    id: row.id,
                    run_status: RunStatus::Completed,
                    exit_status: Some("COMPLETED".into()),
                    metrics: StepMetrics::new(),
                    persistent_user_data: None,
                },
                Utc::now(),
            )
            .unwrap();
    }

    #[test]
    fn first_run_dispatches_every_partition() {
        let fixture = partitioned_step();
        let planner = PartitionPlanner::new(Arc::clone(&fixture.store));
        let plan = planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 4u32))
            .unwrap();
        assert_eq!(plan.plan_size, 4);
        assert!(plan.skip.is_empty());
        assert_eq!(plan.dispatch, vec![0, 1, 2, 3]);
    }

    #[test]
    fn restart_skips_completed_partitions() {
        let fixture = partitioned_step();
        let planner = PartitionPlanner::new(Arc::clone(&fixture.store));
        planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 4u32))
            .unwrap();
        complete_partition(&fixture, 0);
        complete_partition(&fixture, 1);

        let plan = planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 4u32))
            .unwrap();
        assert_eq!(plan.skip, BTreeSet::from([0, 1]));
        assert_eq!(plan.dispatch, vec![2, 3]);
    }

    #[test]
    fn non_deterministic_mapper_cannot_reshape_the_job() {
        let fixture = partitioned_step();
        let planner = PartitionPlanner::new(Arc::clone(&fixture.store));
        planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 4u32))
            .unwrap();

        // A mapper that answers differently on restart is ignored in favor
        // of the stored size.
        let plan = planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 99u32))
            .unwrap();
        assert_eq!(plan.plan_size, 4);
        assert_eq!(plan.dispatch.len(), 4);
    }

    #[test]
    fn plan_size_zero_dispatches_nothing() {
        let fixture = partitioned_step();
        let planner = PartitionPlanner::new(Arc::clone(&fixture.store));
        let plan = planner
            .plan(&fixture.top_key, fixture.top.id, &(|| 0u32))
            .unwrap();
        assert_eq!(plan.plan_size, 0);
        assert!(plan.dispatch.is_empty());
    }
}
