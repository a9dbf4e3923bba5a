//! Synchronized in-memory store for tests and non-persistent deployments.
//!
//! Implements the same [`BatchStore`] interface as a durable backing, with
//! one lock per record collection. Collections are append-only in normal
//! operation; only the administrative purge removes records.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use forgebatch_core::{
    DomainError, JobExecutionId, JobInstanceId, StepExecutionId, WorkerId,
};
use forgebatch_model::{
    InstanceState, JobExecution, JobInstance, JobParameters, PartitionKey, PartitionState,
    RemotablePartition, RunStatus, StepMetrics, StepThreadExecution, StepThreadInstance,
    StepThreadKey,
};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::schema::SchemaCatalog;
use crate::store::{
    BatchStore, ClaimOutcome, NewJobInstance, PartitionStepView, StepExecutionAggregate,
    StepExecutionUpdate, WorkerLocation,
};

/// In-memory batch store.
///
/// Lock order, where an operation touches more than one collection:
/// instances, executions, number reservations, step instances, step
/// executions, partitions. Multi-record updates are validated on clones and
/// committed only when every piece passed, so a failed operation leaves
/// prior state untouched.
pub struct InMemoryBatchStore {
    catalog: SchemaCatalog,
    instances: RwLock<HashMap<JobInstanceId, JobInstance>>,
    executions: RwLock<HashMap<JobExecutionId, JobExecution>>,
    /// Uniqueness index backing atomic execution-number assignment.
    reserved_numbers: Mutex<HashSet<(JobInstanceId, u32)>>,
    step_instances: RwLock<HashMap<StepThreadKey, StepThreadInstance>>,
    step_executions: RwLock<HashMap<StepExecutionId, StepThreadExecution>>,
    /// Per key: every ownership record ever written, superseded ones
    /// included. The live record, if any, is the last non-recovered entry.
    partitions: RwLock<HashMap<PartitionKey, Vec<RemotablePartition>>>,
}

impl InMemoryBatchStore {
    /// Store carrying the newest entity shapes.
    pub fn new() -> Self {
        Self::with_catalog(SchemaCatalog::latest())
    }

    /// Store pinned to specific entity generations, as a mixed-version
    /// cluster member would see after probing a lagging shared store.
    pub fn with_catalog(catalog: SchemaCatalog) -> Self {
        Self {
            catalog,
            instances: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            reserved_numbers: Mutex::new(HashSet::new()),
            step_instances: RwLock::new(HashMap::new()),
            step_executions: RwLock::new(HashMap::new()),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    fn live_partition(records: &[RemotablePartition]) -> Option<&RemotablePartition> {
        records.iter().rev().find(|r| r.state != PartitionState::Recovered)
    }

    fn live_partition_mut(
        records: &mut [RemotablePartition],
    ) -> Option<&mut RemotablePartition> {
        records
            .iter_mut()
            .rev()
            .find(|r| r.state != PartitionState::Recovered)
    }

    /// Link the live ownership record for a freshly created partition step
    /// execution, marking it dispatched to `location`. Missing records are
    /// fine: the dispatcher may predate partition records.
    fn link_partition_dispatch(
        &self,
        key: &StepThreadKey,
        job_execution: JobExecutionId,
        step_execution: StepExecutionId,
        location: &WorkerLocation,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(());
        }
        let partition_key = PartitionKey {
            job_execution,
            step_name: key.step_name.clone(),
            partition: key.partition,
        };
        let mut partitions = self.partitions.write().unwrap();
        if let Some(records) = partitions.get_mut(&partition_key) {
            if let Some(live) = Self::live_partition_mut(records) {
                live.mark_dispatched(
                    location.worker_id.clone(),
                    location.rest_url.clone(),
                    step_execution,
                    now,
                )?;
                debug!(key = %partition_key, worker = %location.worker_id, "partition dispatched");
            }
        }
        Ok(())
    }

    fn top_level_row_id(
        step_executions: &HashMap<StepExecutionId, StepThreadExecution>,
        job_execution: JobExecutionId,
        step_name: &str,
    ) -> Option<StepExecutionId> {
        step_executions
            .values()
            .find(|row| {
                row.job_execution == job_execution
                    && row.step_name == step_name
                    && row.is_top_level()
            })
            .map(|row| row.id)
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStore for InMemoryBatchStore {
    // ---- job instances ----

    fn create_job_instance(
        &self,
        new_instance: NewJobInstance,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instance = JobInstance::new(
            new_instance.job_name,
            new_instance.submitter,
            new_instance.job_definition,
            now,
            self.catalog.instance(),
        );
        instance.app_name = new_instance.app_name;
        instance.mask_to_generation();

        let mut instances = self.instances.write().unwrap();
        instances.insert(instance.id, instance.clone());
        info!(instance = %instance.id, job_name = %instance.job_name, "job instance created");
        Ok(instance)
    }

    fn job_instance(&self, id: JobInstanceId) -> StoreResult<JobInstance> {
        let instances = self.instances.read().unwrap();
        instances
            .get(&id)
            .cloned()
            .ok_or(StoreError::NoSuchJobInstance(id))
    }

    fn job_instance_for_execution(&self, id: JobExecutionId) -> StoreResult<JobInstance> {
        let instance_id = {
            let executions = self.executions.read().unwrap();
            executions
                .get(&id)
                .map(|exec| exec.instance_id)
                .ok_or(StoreError::NoSuchJobExecution(id))?
        };
        self.job_instance(instance_id)
    }

    fn job_instances_by_name(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> StoreResult<Vec<JobInstance>> {
        let instances = self.instances.read().unwrap();
        let mut result: Vec<_> = instances
            .values()
            .filter(|i| i.job_name == job_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(result.into_iter().skip(start).take(count).collect())
    }

    fn job_names(&self) -> StoreResult<BTreeSet<String>> {
        let instances = self.instances.read().unwrap();
        Ok(instances.values().map(|i| i.job_name.clone()).collect())
    }

    fn job_instance_count(
        &self,
        job_name: &str,
        submitter: Option<&str>,
    ) -> StoreResult<usize> {
        let instances = self.instances.read().unwrap();
        Ok(instances
            .values()
            .filter(|i| i.job_name == job_name)
            .filter(|i| submitter.is_none_or(|s| i.submitter == s))
            .count())
    }

    fn update_instance_state(
        &self,
        id: JobInstanceId,
        state: InstanceState,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        let mut updated = instance.clone();
        updated.set_state(state, now)?;
        *instance = updated.clone();
        Ok(updated)
    }

    fn update_instance_state_and_status(
        &self,
        id: JobInstanceId,
        state: InstanceState,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        let mut updated = instance.clone();
        updated.set_state_and_status(state, status, now)?;
        *instance = updated.clone();
        Ok(updated)
    }

    fn mark_instance_resubmitted(
        &self,
        id: JobInstanceId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        if !instance.instance_state.is_restartable() {
            return Err(StoreError::NotRestartable(id));
        }
        let mut updated = instance.clone();
        updated.mark_resubmitted(now)?;
        *instance = updated.clone();
        info!(instance = %id, "job instance resubmitted for restart");
        Ok(updated)
    }

    fn set_instance_restart_step(
        &self,
        id: JobInstanceId,
        restart_on: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        instance.restart_on = restart_on;
        instance.touch(now);
        Ok(instance.clone())
    }

    fn update_instance_job_definition(
        &self,
        id: JobInstanceId,
        job_name: String,
        job_definition: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        instance.job_name = job_name;
        instance.job_definition = job_definition;
        instance.touch(now);
        Ok(instance.clone())
    }

    fn set_instance_group_names(
        &self,
        id: JobInstanceId,
        group_names: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobInstance> {
        if !self.catalog.supports_group_names() {
            return Err(DomainError::configuration(format!(
                "group names require instance generation v3, store is at {}",
                self.catalog.instance()
            ))
            .into());
        }
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobInstance(id))?;
        instance.group_names = Some(group_names);
        instance.touch(now);
        Ok(instance.clone())
    }

    fn purge_job_instance(&self, id: JobInstanceId) -> StoreResult<()> {
        let mut instances = self.instances.write().unwrap();
        if instances.remove(&id).is_none() {
            return Err(StoreError::NoSuchJobInstance(id));
        }

        let mut executions = self.executions.write().unwrap();
        let execution_ids: HashSet<JobExecutionId> = executions
            .values()
            .filter(|e| e.instance_id == id)
            .map(|e| e.id)
            .collect();
        executions.retain(|_, e| e.instance_id != id);

        let mut reserved = self.reserved_numbers.lock().unwrap();
        reserved.retain(|(instance, _)| *instance != id);
        drop(reserved);

        let mut step_instances = self.step_instances.write().unwrap();
        step_instances.retain(|key, _| key.job_instance != id);

        let mut step_executions = self.step_executions.write().unwrap();
        step_executions.retain(|_, row| !execution_ids.contains(&row.job_execution));

        let mut partitions = self.partitions.write().unwrap();
        partitions.retain(|key, _| !execution_ids.contains(&key.job_execution));

        info!(instance = %id, "job instance purged");
        Ok(())
    }

    // ---- job executions ----

    fn create_job_execution(
        &self,
        instance_id: JobInstanceId,
        parameters: JobParameters,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        {
            let instances = self.instances.read().unwrap();
            if !instances.contains_key(&instance_id) {
                return Err(StoreError::NoSuchJobInstance(instance_id));
            }
        }

        // Max-plus-one numbering. The reservation set is the uniqueness
        // constraint; losing a reservation race means another creation is in
        // flight, so re-read the maximum and try again.
        let execution_number = loop {
            let observed_max = {
                let executions = self.executions.read().unwrap();
                executions
                    .values()
                    .filter(|e| e.instance_id == instance_id)
                    .map(|e| e.execution_number)
                    .max()
                    .unwrap_or(0)
            };
            let candidate = observed_max + 1;
            let mut reserved = self.reserved_numbers.lock().unwrap();
            if reserved.insert((instance_id, candidate)) {
                break candidate;
            }
            drop(reserved);
            debug!(instance = %instance_id, candidate, "lost execution-number race, retrying");
            std::thread::yield_now();
        };

        let execution = JobExecution::new(
            instance_id,
            execution_number,
            parameters,
            now,
            self.catalog.execution(),
        );

        let mut instances = self.instances.write().unwrap();
        let Some(instance) = instances.get_mut(&instance_id) else {
            // Instance purged between the existence check and here; release
            // the reservation so the number is not leaked.
            let mut reserved = self.reserved_numbers.lock().unwrap();
            reserved.remove(&(instance_id, execution_number));
            return Err(StoreError::NoSuchJobInstance(instance_id));
        };
        instance.num_executions = instance.num_executions.max(execution_number);
        instance.set_latest_run_status(RunStatus::Queued, now);

        let mut executions = self.executions.write().unwrap();
        executions.insert(execution.id, execution.clone());
        info!(
            execution = %execution.id,
            instance = %instance_id,
            number = execution_number,
            "job execution created"
        );
        Ok(execution)
    }

    fn job_execution(&self, id: JobExecutionId) -> StoreResult<JobExecution> {
        let executions = self.executions.read().unwrap();
        executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NoSuchJobExecution(id))
    }

    fn job_execution_by_number(
        &self,
        instance_id: JobInstanceId,
        execution_number: u32,
    ) -> StoreResult<JobExecution> {
        {
            let instances = self.instances.read().unwrap();
            if !instances.contains_key(&instance_id) {
                return Err(StoreError::NoSuchJobInstance(instance_id));
            }
        }
        let executions = self.executions.read().unwrap();
        executions
            .values()
            .find(|e| e.instance_id == instance_id && e.execution_number == execution_number)
            .cloned()
            .ok_or(StoreError::NoSuchExecutionNumber {
                instance: instance_id,
                number: execution_number,
            })
    }

    fn job_executions_for_instance(
        &self,
        instance_id: JobInstanceId,
    ) -> StoreResult<Vec<JobExecution>> {
        {
            let instances = self.instances.read().unwrap();
            if !instances.contains_key(&instance_id) {
                return Err(StoreError::NoSuchJobInstance(instance_id));
            }
        }
        let executions = self.executions.read().unwrap();
        let mut result: Vec<_> = executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect();
        // Most recent first; numbering is the container's own order.
        result.sort_by(|a, b| b.execution_number.cmp(&a.execution_number));
        Ok(result)
    }

    fn job_executions_for_worker(
        &self,
        worker: &WorkerId,
        statuses: &[RunStatus],
    ) -> StoreResult<Vec<JobExecution>> {
        let executions = self.executions.read().unwrap();
        let mut result: Vec<_> = executions
            .values()
            .filter(|e| e.worker_id.as_ref() == Some(worker))
            .filter(|e| statuses.contains(&e.run_status))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.create_time.cmp(&b.create_time));
        Ok(result)
    }

    fn job_executions_for_job_name(
        &self,
        job_name: &str,
        statuses: &[RunStatus],
    ) -> StoreResult<Vec<JobExecution>> {
        let matching_instances: HashSet<JobInstanceId> = {
            let instances = self.instances.read().unwrap();
            instances
                .values()
                .filter(|i| i.job_name == job_name)
                .map(|i| i.id)
                .collect()
        };
        let executions = self.executions.read().unwrap();
        let mut result: Vec<_> = executions
            .values()
            .filter(|e| matching_instances.contains(&e.instance_id))
            .filter(|e| statuses.contains(&e.run_status))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(result)
    }

    fn claim_job_execution(
        &self,
        id: JobExecutionId,
        location: &WorkerLocation,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;

        if exec.is_owned_by(&location.worker_id) {
            debug!(execution = %id, worker = %location.worker_id, "claim repeated by owner");
            return Ok(ClaimOutcome::AlreadyOwned(exec.clone()));
        }
        if exec.worker_id.is_some() {
            return Err(StoreError::AssignedToWorker(id));
        }
        if exec.run_status != RunStatus::Queued {
            // Stopped (or otherwise finished) before any worker picked it up.
            return Err(StoreError::NotClaimable(id));
        }

        let mut updated = exec.clone();
        updated.assign_owner(location.worker_id.clone(), location.rest_url.clone(), now)?;
        *exec = updated.clone();
        info!(execution = %id, worker = %location.worker_id, "job execution claimed");
        Ok(ClaimOutcome::Claimed(updated))
    }

    fn mark_execution_started(
        &self,
        id: JobExecutionId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        let mut instances = self.instances.write().unwrap();
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;
        let instance = instances
            .get_mut(&exec.instance_id)
            .ok_or(StoreError::NoSuchJobInstance(exec.instance_id))?;

        let mut updated_exec = exec.clone();
        updated_exec.mark_started(now)?;
        let mut updated_instance = instance.clone();
        updated_instance.set_state_and_status(InstanceState::Dispatched, RunStatus::Started, now)?;

        *exec = updated_exec.clone();
        *instance = updated_instance;
        Ok(updated_exec)
    }

    fn update_execution_status(
        &self,
        id: JobExecutionId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        let mut instances = self.instances.write().unwrap();
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;
        let instance = instances
            .get_mut(&exec.instance_id)
            .ok_or(StoreError::NoSuchJobInstance(exec.instance_id))?;

        let mut updated = exec.clone();
        updated.set_status(status, now)?;
        *exec = updated.clone();
        instance.set_latest_run_status(status, now);
        Ok(updated)
    }

    fn stop_unclaimed_execution(
        &self,
        id: JobExecutionId,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        let mut instances = self.instances.write().unwrap();
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;
        if exec.worker_id.is_some() {
            return Err(StoreError::AssignedToWorker(id));
        }
        let instance = instances
            .get_mut(&exec.instance_id)
            .ok_or(StoreError::NoSuchJobInstance(exec.instance_id))?;

        let mut updated_exec = exec.clone();
        updated_exec.mark_ended(RunStatus::Stopped, None, now)?;
        let mut updated_instance = instance.clone();
        updated_instance.record_execution_end(RunStatus::Stopped, None, now)?;

        *exec = updated_exec.clone();
        *instance = updated_instance;
        info!(execution = %id, "job execution stopped before pickup");
        Ok(updated_exec)
    }

    fn finish_job_execution(
        &self,
        id: JobExecutionId,
        status: RunStatus,
        exit_status: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        if !status.is_terminal() {
            return Err(DomainError::validation(format!(
                "finish requires a terminal status, got {status}"
            ))
            .into());
        }
        let mut instances = self.instances.write().unwrap();
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;
        let instance = instances
            .get_mut(&exec.instance_id)
            .ok_or(StoreError::NoSuchJobInstance(exec.instance_id))?;

        let mut updated_exec = exec.clone();
        updated_exec.mark_ended(status, exit_status.clone(), now)?;
        let mut updated_instance = instance.clone();
        updated_instance.record_execution_end(status, updated_exec.exit_status.clone(), now)?;

        *exec = updated_exec.clone();
        *instance = updated_instance;
        info!(execution = %id, %status, "job execution finished");
        Ok(updated_exec)
    }

    fn set_execution_log_dir(
        &self,
        id: JobExecutionId,
        log_dir: String,
        now: DateTime<Utc>,
    ) -> StoreResult<JobExecution> {
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(&id)
            .ok_or(StoreError::NoSuchJobExecution(id))?;
        exec.set_log_dir(log_dir, now);
        Ok(exec.clone())
    }

    // ---- step thread instances and executions ----

    fn step_thread_instance(
        &self,
        key: &StepThreadKey,
    ) -> StoreResult<Option<StepThreadInstance>> {
        let step_instances = self.step_instances.read().unwrap();
        Ok(step_instances.get(key).cloned())
    }

    fn create_top_level_step(
        &self,
        job_execution: JobExecutionId,
        key: StepThreadKey,
        partitioned: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        key.validate()?;
        if !key.partition.is_top_level() {
            return Err(
                DomainError::validation("top-level step key must use the top-level sentinel")
                    .into(),
            );
        }
        {
            let executions = self.executions.read().unwrap();
            let exec = executions
                .get(&job_execution)
                .ok_or(StoreError::NoSuchJobExecution(job_execution))?;
            if exec.instance_id != key.job_instance {
                return Err(DomainError::validation(format!(
                    "execution {job_execution} does not belong to instance {}",
                    key.job_instance
                ))
                .into());
            }
        }

        let mut step_instances = self.step_instances.write().unwrap();
        if step_instances.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        let mut step_executions = self.step_executions.write().unwrap();
        if Self::top_level_row_id(&step_executions, job_execution, &key.step_name).is_some() {
            return Err(StoreError::DuplicateKey(format!(
                "{job_execution}/{}/top-level",
                key.step_name
            )));
        }

        let execution = StepThreadExecution::new_top_level(
            job_execution,
            key.step_name.clone(),
            partitioned,
            now,
            self.catalog.partition(),
        );
        let instance = StepThreadInstance::new_top_level(key.clone(), partitioned, execution.id);
        step_executions.insert(execution.id, execution.clone());
        step_instances.insert(key, instance);
        Ok(execution)
    }

    fn create_partition_step(
        &self,
        job_execution: JobExecutionId,
        key: StepThreadKey,
        dispatcher: Option<&WorkerLocation>,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        key.validate()?;
        if key.partition.is_top_level() {
            return Err(
                DomainError::validation("partition step key must carry a partition number").into(),
            );
        }

        let execution = {
            let mut step_instances = self.step_instances.write().unwrap();
            if step_instances.contains_key(&key) {
                return Err(StoreError::DuplicateKey(key.to_string()));
            }
            let mut step_executions = self.step_executions.write().unwrap();
            let top_level =
                Self::top_level_row_id(&step_executions, job_execution, &key.step_name)
                    .ok_or_else(|| StoreError::NoTopLevelStepExecution {
                        job_execution,
                        step_name: key.step_name.clone(),
                    })?;
            let duplicate = step_executions.values().any(|row| {
                row.job_execution == job_execution
                    && row.step_name == key.step_name
                    && row.partition == key.partition
            });
            if duplicate {
                return Err(StoreError::DuplicateKey(format!(
                    "{job_execution}/{}/{}",
                    key.step_name, key.partition
                )));
            }

            let execution = StepThreadExecution::new_partition(
                job_execution,
                key.step_name.clone(),
                key.partition,
                top_level,
                now,
                self.catalog.partition(),
            );
            let instance = StepThreadInstance::new_partition(key.clone(), execution.id);
            step_executions.insert(execution.id, execution.clone());
            step_instances.insert(key.clone(), instance);
            execution
        };

        if let Some(location) = dispatcher {
            self.link_partition_dispatch(&key, job_execution, execution.id, location, now)?;
        }
        Ok(execution)
    }

    fn restart_top_level_step(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        {
            let executions = self.executions.read().unwrap();
            if !executions.contains_key(&job_execution) {
                return Err(StoreError::NoSuchJobExecution(job_execution));
            }
        }
        let mut step_instances = self.step_instances.write().unwrap();
        let instance = step_instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
        let info = instance
            .top_level
            .clone()
            .ok_or_else(|| DomainError::validation("restart target is not a top-level step"))?;

        let mut step_executions = self.step_executions.write().unwrap();
        if Self::top_level_row_id(&step_executions, job_execution, &key.step_name).is_some() {
            return Err(StoreError::DuplicateKey(format!(
                "{job_execution}/{}/top-level",
                key.step_name
            )));
        }
        let prior_user_data = step_executions
            .get(&instance.latest_execution)
            .and_then(|row| row.persistent_user_data.clone());

        let mut execution = StepThreadExecution::new_top_level(
            job_execution,
            key.step_name.clone(),
            info.partitioned,
            now,
            self.catalog.partition(),
        );
        execution.persistent_user_data = prior_user_data;

        instance.increment_start_count();
        instance.latest_execution = execution.id;
        step_executions.insert(execution.id, execution.clone());
        debug!(key = %key, "top-level step restarted from previous instance");
        Ok(execution)
    }

    fn restart_top_level_step_clean(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        {
            let executions = self.executions.read().unwrap();
            if !executions.contains_key(&job_execution) {
                return Err(StoreError::NoSuchJobExecution(job_execution));
            }
        }
        let mut step_instances = self.step_instances.write().unwrap();
        let instance = step_instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
        let info = instance
            .top_level
            .clone()
            .ok_or_else(|| DomainError::validation("restart target is not a top-level step"))?;

        let mut step_executions = self.step_executions.write().unwrap();
        if Self::top_level_row_id(&step_executions, job_execution, &key.step_name).is_some() {
            return Err(StoreError::DuplicateKey(format!(
                "{job_execution}/{}/top-level",
                key.step_name
            )));
        }

        let execution = StepThreadExecution::new_top_level(
            job_execution,
            key.step_name.clone(),
            info.partitioned,
            now,
            self.catalog.partition(),
        );

        // Begin-over semantics: no user data carried, checkpoint dropped.
        instance.increment_start_count();
        instance.clear_checkpoint();
        instance.latest_execution = execution.id;
        step_executions.insert(execution.id, execution.clone());
        debug!(key = %key, "top-level step restarted clean");
        Ok(execution)
    }

    fn restart_partition_step(
        &self,
        job_execution: JobExecutionId,
        key: &StepThreadKey,
        dispatcher: Option<&WorkerLocation>,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        let execution = {
            let mut step_instances = self.step_instances.write().unwrap();
            let instance = step_instances
                .get_mut(key)
                .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
            if instance.is_top_level() {
                return Err(
                    DomainError::validation("restart target is not a partition step").into(),
                );
            }

            let mut step_executions = self.step_executions.write().unwrap();
            let top_level =
                Self::top_level_row_id(&step_executions, job_execution, &key.step_name)
                    .ok_or_else(|| StoreError::NoTopLevelStepExecution {
                        job_execution,
                        step_name: key.step_name.clone(),
                    })?;
            let same_triple_exists = step_executions.values().any(|row| {
                row.job_execution == job_execution
                    && row.step_name == key.step_name
                    && row.partition == key.partition
            });
            if same_triple_exists {
                // A second attempt under the same job execution is legal
                // only as the redispatch of a recovered partition; the dead
                // owner's row stays behind as history.
                let partition_key = PartitionKey {
                    job_execution,
                    step_name: key.step_name.clone(),
                    partition: key.partition,
                };
                let recovered = {
                    let partitions = self.partitions.read().unwrap();
                    partitions.get(&partition_key).is_some_and(|records| {
                        records
                            .iter()
                            .any(|record| record.state == PartitionState::Recovered)
                    })
                };
                if !recovered {
                    return Err(StoreError::DuplicateKey(format!(
                        "{job_execution}/{}/{}",
                        key.step_name, key.partition
                    )));
                }
            }
            let prior_user_data = step_executions
                .get(&instance.latest_execution)
                .and_then(|row| row.persistent_user_data.clone());

            let mut execution = StepThreadExecution::new_partition(
                job_execution,
                key.step_name.clone(),
                key.partition,
                top_level,
                now,
                self.catalog.partition(),
            );
            execution.persistent_user_data = prior_user_data;

            instance.latest_execution = execution.id;
            step_executions.insert(execution.id, execution.clone());
            execution
        };

        if let Some(location) = dispatcher {
            self.link_partition_dispatch(key, job_execution, execution.id, location, now)?;
        }
        Ok(execution)
    }

    fn write_checkpoint(
        &self,
        key: &StepThreadKey,
        data: Vec<u8>,
    ) -> StoreResult<StepThreadInstance> {
        let mut step_instances = self.step_instances.write().unwrap();
        let instance = step_instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
        instance.set_checkpoint(data);
        Ok(instance.clone())
    }

    fn clear_checkpoint(&self, key: &StepThreadKey) -> StoreResult<StepThreadInstance> {
        let mut step_instances = self.step_instances.write().unwrap();
        let instance = step_instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
        instance.clear_checkpoint();
        Ok(instance.clone())
    }

    fn fix_partition_plan_size(
        &self,
        key: &StepThreadKey,
        plan_size: u32,
    ) -> StoreResult<StepThreadInstance> {
        let mut step_instances = self.step_instances.write().unwrap();
        let instance = step_instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchStepThreadInstance(key.to_string()))?;
        instance.set_plan_size(plan_size)?;
        Ok(instance.clone())
    }

    fn completed_partition_numbers(&self, top_level: &StepThreadKey) -> StoreResult<Vec<u32>> {
        let step_instances = self.step_instances.read().unwrap();
        let step_executions = self.step_executions.read().unwrap();
        let mut numbers: Vec<u32> = step_instances
            .values()
            .filter(|instance| {
                instance.key.job_instance == top_level.job_instance
                    && instance.key.step_name == top_level.step_name
                    && !instance.key.partition.is_top_level()
            })
            .filter(|instance| {
                step_executions
                    .get(&instance.latest_execution)
                    .is_some_and(|row| row.run_status == RunStatus::Completed)
            })
            .map(|instance| instance.key.partition.as_i32() as u32)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn delete_partition_step_instances(&self, top_level: &StepThreadKey) -> StoreResult<()> {
        let mut step_instances = self.step_instances.write().unwrap();
        step_instances.retain(|key, _| {
            !(key.job_instance == top_level.job_instance
                && key.step_name == top_level.step_name
                && !key.partition.is_top_level())
        });
        Ok(())
    }

    fn step_execution(&self, id: StepExecutionId) -> StoreResult<StepThreadExecution> {
        let step_executions = self.step_executions.read().unwrap();
        step_executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NoSuchStepExecution(id))
    }

    fn update_step_execution(
        &self,
        update: StepExecutionUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<StepThreadExecution> {
        let updated = {
            let mut step_executions = self.step_executions.write().unwrap();
            let row = step_executions
                .get_mut(&update.id)
                .ok_or(StoreError::NoSuchStepExecution(update.id))?;

            if !update.metrics.is_monotonic_successor_of(&row.metrics) {
                return Err(DomainError::validation(format!(
                    "metrics snapshot for step execution {} would decrease a counter",
                    update.id
                ))
                .into());
            }

            let mut updated = row.clone();
            if update.run_status.is_terminal() {
                updated.mark_ended(update.run_status, update.exit_status.clone(), now)?;
            } else {
                updated.set_status(update.run_status)?;
                updated.exit_status = update
                    .exit_status
                    .clone()
                    .map(forgebatch_core::limits::truncate_exit_status);
            }
            updated.metrics = update.metrics;
            updated.persistent_user_data = update.persistent_user_data.clone();
            *row = updated.clone();
            updated
        };

        // A partition row completing closes out its live ownership record.
        if !updated.is_top_level()
            && updated.run_status == RunStatus::Completed
            && self.catalog.supports_remotable_partitions()
        {
            let partition_key = PartitionKey {
                job_execution: updated.job_execution,
                step_name: updated.step_name.clone(),
                partition: updated.partition,
            };
            let mut partitions = self.partitions.write().unwrap();
            if let Some(records) = partitions.get_mut(&partition_key) {
                if let Some(live) = Self::live_partition_mut(records) {
                    if live.state == PartitionState::Dispatched {
                        live.mark_completed(now)?;
                    }
                }
            }
        }
        Ok(updated)
    }

    fn aggregate_top_level_metrics(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<StepThreadExecution> {
        let mut step_executions = self.step_executions.write().unwrap();
        let partition_metrics: Vec<StepMetrics> = step_executions
            .values()
            .filter(|row| row.top_level_execution == top_level && row.id != top_level)
            .map(|row| row.metrics)
            .collect();

        let row = step_executions
            .get_mut(&top_level)
            .ok_or(StoreError::NoSuchStepExecution(top_level))?;
        if !row.is_top_level() {
            return Err(DomainError::validation(format!(
                "step execution {top_level} is not a top-level row"
            ))
            .into());
        }
        row.metrics = StepMetrics::sum(partition_metrics.iter());
        debug!(step_execution = %top_level, partitions = partition_metrics.len(), "metrics aggregated");
        Ok(row.clone())
    }

    fn top_level_step_executions(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<StepThreadExecution>> {
        {
            let executions = self.executions.read().unwrap();
            if !executions.contains_key(&job_execution) {
                return Err(StoreError::NoSuchJobExecution(job_execution));
            }
        }
        let step_executions = self.step_executions.read().unwrap();
        let mut result: Vec<_> = step_executions
            .values()
            .filter(|row| row.job_execution == job_execution && row.is_top_level())
            .cloned()
            .collect();
        result.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(result)
    }

    fn running_step_executions(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<StepThreadExecution>> {
        let step_executions = self.step_executions.read().unwrap();
        let mut result: Vec<_> = step_executions
            .values()
            .filter(|row| row.job_execution == job_execution && row.run_status.is_running())
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    fn step_execution_aggregate(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<StepExecutionAggregate> {
        let step_executions = self.step_executions.read().unwrap();
        let top_row = step_executions
            .get(&top_level)
            .cloned()
            .ok_or(StoreError::NoSuchStepExecution(top_level))?;
        if !top_row.is_top_level() {
            return Err(DomainError::validation(format!(
                "step execution {top_level} is not a top-level row"
            ))
            .into());
        }

        let mut partition_rows: Vec<_> = step_executions
            .values()
            .filter(|row| row.top_level_execution == top_level && row.id != top_level)
            .cloned()
            .collect();
        partition_rows.sort_by_key(|row| row.partition);

        let partitions_map = self.partitions.read().unwrap();
        let partitions = partition_rows
            .into_iter()
            .map(|execution| {
                let remotable = if self.catalog.supports_remotable_partitions() {
                    let key = PartitionKey {
                        job_execution: execution.job_execution,
                        step_name: execution.step_name.clone(),
                        partition: execution.partition,
                    };
                    partitions_map
                        .get(&key)
                        .and_then(|records| records.last())
                        .cloned()
                } else {
                    None
                };
                PartitionStepView {
                    execution,
                    remotable,
                }
            })
            .collect();

        Ok(StepExecutionAggregate {
            top_level: top_row,
            partitions,
        })
    }

    fn step_execution_aggregate_for_execution(
        &self,
        job_execution: JobExecutionId,
        step_name: &str,
    ) -> StoreResult<StepExecutionAggregate> {
        let top_level = {
            let step_executions = self.step_executions.read().unwrap();
            Self::top_level_row_id(&step_executions, job_execution, step_name).ok_or(
                StoreError::NoTopLevelStepExecution {
                    job_execution,
                    step_name: step_name.to_string(),
                },
            )?
        };
        self.step_execution_aggregate(top_level)
    }

    // ---- remotable partitions ----

    fn create_remotable_partition(
        &self,
        key: PartitionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RemotablePartition>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(None);
        }
        {
            let executions = self.executions.read().unwrap();
            if !executions.contains_key(&key.job_execution) {
                return Err(StoreError::NoSuchJobExecution(key.job_execution));
            }
        }
        let mut partitions = self.partitions.write().unwrap();
        let records = partitions.entry(key.clone()).or_default();
        if Self::live_partition(records).is_some() {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        let record = RemotablePartition::new_queued(key, now);
        records.push(record.clone());
        debug!(key = %record.key, "remotable partition queued");
        Ok(Some(record))
    }

    fn remotable_partition_state(
        &self,
        key: &PartitionKey,
    ) -> StoreResult<Option<PartitionState>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(None);
        }
        let partitions = self.partitions.read().unwrap();
        Ok(partitions
            .get(key)
            .and_then(|records| records.last())
            .map(|record| record.state))
    }

    fn mark_partition_recovered(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<RemotablePartition> {
        let mut partitions = self.partitions.write().unwrap();
        let records = partitions
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchRemotablePartition(key.to_string()))?;

        if let Some(live) = Self::live_partition_mut(records) {
            live.mark_recovered(now)?;
            info!(key = %key, "remotable partition recovered");
            return Ok(live.clone());
        }
        // Already recovered by a racing worker; the redundant write is
        // harmless.
        records
            .last()
            .cloned()
            .ok_or_else(|| StoreError::NoSuchRemotablePartition(key.to_string()))
    }

    fn recovered_partition_numbers(
        &self,
        top_level: StepExecutionId,
    ) -> StoreResult<Vec<u32>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(Vec::new());
        }
        let (job_execution, step_name) = {
            let step_executions = self.step_executions.read().unwrap();
            let row = step_executions
                .get(&top_level)
                .ok_or(StoreError::NoSuchStepExecution(top_level))?;
            (row.job_execution, row.step_name.clone())
        };
        let partitions = self.partitions.read().unwrap();
        let mut numbers: Vec<u32> = partitions
            .iter()
            .filter(|(key, _)| key.job_execution == job_execution && key.step_name == step_name)
            .filter(|(_, records)| {
                records
                    .iter()
                    .any(|record| record.state == PartitionState::Recovered)
            })
            .map(|(key, _)| key.partition.as_i32() as u32)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn remotable_partitions_for_execution(
        &self,
        job_execution: JobExecutionId,
    ) -> StoreResult<Vec<RemotablePartition>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(Vec::new());
        }
        {
            let executions = self.executions.read().unwrap();
            if !executions.contains_key(&job_execution) {
                return Err(StoreError::NoSuchJobExecution(job_execution));
            }
        }
        let partitions = self.partitions.read().unwrap();
        let mut result: Vec<_> = partitions
            .iter()
            .filter(|(key, _)| key.job_execution == job_execution)
            .filter_map(|(_, records)| records.last().cloned())
            .collect();
        result.sort_by(|a, b| {
            (&a.key.step_name, a.key.partition).cmp(&(&b.key.step_name, b.key.partition))
        });
        Ok(result)
    }

    fn remotable_partitions_for_worker(
        &self,
        worker: &WorkerId,
    ) -> StoreResult<Vec<RemotablePartition>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(Vec::new());
        }
        let partitions = self.partitions.read().unwrap();
        let mut result: Vec<_> = partitions
            .values()
            .filter_map(|records| Self::live_partition(records))
            .filter(|record| {
                record.state == PartitionState::Dispatched
                    && record.worker_id.as_ref() == Some(worker)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            (&a.key.step_name, a.key.partition).cmp(&(&b.key.step_name, b.key.partition))
        });
        Ok(result)
    }

    fn set_partition_log_dir(
        &self,
        key: &PartitionKey,
        log_dir: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RemotablePartition>> {
        if !self.catalog.supports_remotable_partitions() {
            return Ok(None);
        }
        let mut partitions = self.partitions.write().unwrap();
        let Some(records) = partitions.get_mut(key) else {
            return Ok(None);
        };
        match Self::live_partition_mut(records) {
            Some(live) => {
                live.set_log_dir(log_dir, now);
                Ok(Some(live.clone()))
            }
            None => Ok(None),
        }
    }
}
