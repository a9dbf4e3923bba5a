//! Step thread instances and executions.
//!
//! A "step thread" is one step, or one partition of a step, considered as a
//! restart-spanning unit of work. The instance carries what must survive
//! restarts (checkpoint data, start count, the fixed partition plan); each
//! run attempt gets its own execution record with status and metrics.

use chrono::{DateTime, Utc};
use forgebatch_core::limits::{truncate_exit_status, validate_step_name};
use forgebatch_core::{DomainError, DomainResult, JobExecutionId, JobInstanceId, StepExecutionId};
use serde::{Deserialize, Serialize};

use crate::generation::Generation;
use crate::metrics::StepMetrics;
use crate::status::RunStatus;

/// Plan size value meaning "not yet computed" (distinct from the valid
/// value 0).
pub const PLAN_SIZE_UNSET: i32 = -1;

/// Partition number within a step.
///
/// `-1` is the sentinel for the top-level thread; real partitions are
/// numbered `0..N-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionNumber(i32);

impl PartitionNumber {
    /// The top-level (non-partition) sentinel.
    pub const TOP_LEVEL: PartitionNumber = PartitionNumber(-1);

    /// A real partition number.
    pub fn partition(number: u32) -> Self {
        Self(number as i32)
    }

    pub fn is_top_level(&self) -> bool {
        self.0 < 0
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl core::fmt::Display for PartitionNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_top_level() {
            f.write_str("top-level")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Composite key of a step thread instance: unique within a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepThreadKey {
    pub job_instance: JobInstanceId,
    pub step_name: String,
    pub partition: PartitionNumber,
}

impl StepThreadKey {
    pub fn top_level(job_instance: JobInstanceId, step_name: impl Into<String>) -> Self {
        Self {
            job_instance,
            step_name: step_name.into(),
            partition: PartitionNumber::TOP_LEVEL,
        }
    }

    pub fn partition(
        job_instance: JobInstanceId,
        step_name: impl Into<String>,
        number: u32,
    ) -> Self {
        Self {
            job_instance,
            step_name: step_name.into(),
            partition: PartitionNumber::partition(number),
        }
    }

    /// Validate the step name against the field limits.
    pub fn validate(&self) -> DomainResult<()> {
        validate_step_name(&self.step_name)
    }
}

impl core::fmt::Display for StepThreadKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_instance, self.step_name, self.partition
        )
    }
}

/// Extra state carried only by the top-level step thread instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopLevelStepInfo {
    /// How many times this step has been (re)started across executions.
    pub start_count: u32,
    /// Partition count fixed at first dispatch; [`PLAN_SIZE_UNSET`] until
    /// computed, immutable afterwards.
    pub plan_size: i32,
    /// Whether the step definition declares partitions. A property of the
    /// step, not of which thread runs it.
    pub partitioned: bool,
}

/// Durable, restart-spanning identity of a step or step partition.
///
/// Checkpoint data belongs exclusively to this identity and is overwritten
/// wholesale on each checkpoint, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadInstance {
    pub key: StepThreadKey,
    /// Opaque checkpoint blob written by step logic; decoded lazily.
    pub checkpoint: Option<Vec<u8>>,
    /// The most recent execution of this step thread.
    pub latest_execution: StepExecutionId,
    /// Present on the top-level thread only.
    pub top_level: Option<TopLevelStepInfo>,
}

impl StepThreadInstance {
    /// Create the top-level instance for a step's first run. The start
    /// count begins at 1.
    pub fn new_top_level(
        key: StepThreadKey,
        partitioned: bool,
        latest_execution: StepExecutionId,
    ) -> Self {
        debug_assert!(key.partition.is_top_level());
        Self {
            key,
            checkpoint: None,
            latest_execution,
            top_level: Some(TopLevelStepInfo {
                start_count: 1,
                plan_size: PLAN_SIZE_UNSET,
                partitioned,
            }),
        }
    }

    /// Create a partition-level instance for a partition's first run.
    pub fn new_partition(key: StepThreadKey, latest_execution: StepExecutionId) -> Self {
        debug_assert!(!key.partition.is_top_level());
        Self {
            key,
            checkpoint: None,
            latest_execution,
            top_level: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.top_level.is_some()
    }

    pub fn step_name(&self) -> &str {
        &self.key.step_name
    }

    /// Overwrite the checkpoint blob wholesale.
    pub fn set_checkpoint(&mut self, data: Vec<u8>) {
        self.checkpoint = Some(data);
    }

    /// Discard the checkpoint blob (e.g. on terminal success, or on a
    /// from-scratch restart).
    pub fn clear_checkpoint(&mut self) {
        self.checkpoint = None;
    }

    /// Decode the checkpoint blob as JSON into a step-defined type.
    ///
    /// Corrupt or incompatible data is a fatal state error for this step
    /// thread, never silently ignored.
    pub fn checkpoint_as<T: serde::de::DeserializeOwned>(&self) -> DomainResult<Option<T>> {
        match &self.checkpoint {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| DomainError::decode(format!("checkpoint data: {e}"))),
        }
    }

    /// Fix the partition plan size, first dispatch only.
    ///
    /// Once set to a non-sentinel value the size must never change for the
    /// life of the instance, so a partition mapper that is non-deterministic
    /// across restarts cannot reshape an in-flight job. Setting the same
    /// size again is a no-op.
    pub fn set_plan_size(&mut self, size: u32) -> DomainResult<()> {
        let info = self.top_level.as_mut().ok_or_else(|| {
            DomainError::validation("partition plan size only applies to a top-level step thread")
        })?;
        let size = size as i32;
        if info.plan_size != PLAN_SIZE_UNSET && info.plan_size != size {
            return Err(DomainError::validation(format!(
                "partition plan size already fixed at {} for step {}; refusing {}",
                info.plan_size, self.key.step_name, size
            )));
        }
        info.plan_size = size;
        Ok(())
    }

    /// The fixed plan size, if it has been computed.
    pub fn plan_size(&self) -> Option<u32> {
        self.top_level
            .as_ref()
            .filter(|info| info.plan_size != PLAN_SIZE_UNSET)
            .map(|info| info.plan_size as u32)
    }

    /// Bump the start count on a top-level restart.
    pub fn increment_start_count(&mut self) {
        if let Some(info) = self.top_level.as_mut() {
            info.start_count += 1;
        }
    }
}

/// One run attempt of a step thread.
///
/// Created `Starting` on the executing thread. The `top_level_execution`
/// reference is set to the row's own id for top-level rows and to the
/// owning top-level row's id for partition rows — an explicit field, never
/// object aliasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadExecution {
    pub id: StepExecutionId,
    pub job_execution: JobExecutionId,
    pub step_name: String,
    pub partition: PartitionNumber,
    pub run_status: RunStatus,
    pub exit_status: Option<String>,
    pub metrics: StepMetrics,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque user data persisted by step logic; decoded lazily. Carried
    /// forward to the next attempt on restart.
    pub persistent_user_data: Option<Vec<u8>>,
    /// Reserved bookkeeping flag, not interpreted by the registry.
    pub internal_status: i32,
    pub top_level_execution: StepExecutionId,
    /// Whether the step is partitioned. Present on top-level rows only.
    pub partitioned: Option<bool>,
    /// Shape generation this record was written at.
    pub generation: Generation,
}

impl StepThreadExecution {
    /// Create the top-level execution row for one attempt of a step.
    pub fn new_top_level(
        job_execution: JobExecutionId,
        step_name: impl Into<String>,
        partitioned: bool,
        create_time: DateTime<Utc>,
        generation: Generation,
    ) -> Self {
        let id = StepExecutionId::new();
        Self {
            id,
            job_execution,
            step_name: step_name.into(),
            partition: PartitionNumber::TOP_LEVEL,
            run_status: RunStatus::Starting,
            exit_status: None,
            metrics: StepMetrics::new(),
            start_time: Some(create_time),
            end_time: None,
            persistent_user_data: None,
            internal_status: 0,
            // Top-level rows reference themselves.
            top_level_execution: id,
            partitioned: Some(partitioned),
            generation,
        }
    }

    /// Create a partition-level execution row under a top-level execution.
    pub fn new_partition(
        job_execution: JobExecutionId,
        step_name: impl Into<String>,
        partition: PartitionNumber,
        top_level_execution: StepExecutionId,
        create_time: DateTime<Utc>,
        generation: Generation,
    ) -> Self {
        debug_assert!(!partition.is_top_level());
        Self {
            id: StepExecutionId::new(),
            job_execution,
            step_name: step_name.into(),
            partition,
            run_status: RunStatus::Starting,
            exit_status: None,
            metrics: StepMetrics::new(),
            start_time: Some(create_time),
            end_time: None,
            persistent_user_data: None,
            internal_status: 0,
            top_level_execution,
            partitioned: None,
            generation,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.partition.is_top_level()
    }

    pub fn set_status(&mut self, status: RunStatus) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(status)?;
        Ok(())
    }

    /// Drive the attempt to a terminal status with its exit status
    /// (truncated to the persistable limit).
    pub fn mark_ended(
        &mut self,
        status: RunStatus,
        exit_status: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(status)?;
        self.exit_status = exit_status.map(truncate_exit_status);
        self.end_time = Some(now);
        Ok(())
    }

    /// Decode the persisted user data as JSON into a step-defined type.
    pub fn user_data_as<T: serde::de::DeserializeOwned>(&self) -> DomainResult<Option<T>> {
        match &self.persistent_user_data {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| DomainError::decode(format!("persisted user data: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_level_key() -> StepThreadKey {
        StepThreadKey::top_level(JobInstanceId::new(), "load")
    }

    #[test]
    fn partition_number_sentinel() {
        assert!(PartitionNumber::TOP_LEVEL.is_top_level());
        assert!(!PartitionNumber::partition(0).is_top_level());
        assert_eq!(PartitionNumber::TOP_LEVEL.as_i32(), -1);
    }

    #[test]
    fn plan_size_is_fixed_once_set() {
        let mut instance =
            StepThreadInstance::new_top_level(top_level_key(), true, StepExecutionId::new());
        assert_eq!(instance.plan_size(), None);

        instance.set_plan_size(4).unwrap();
        assert_eq!(instance.plan_size(), Some(4));

        // Same value again is fine; a different one is not.
        instance.set_plan_size(4).unwrap();
        assert!(instance.set_plan_size(5).is_err());
        assert_eq!(instance.plan_size(), Some(4));
    }

    #[test]
    fn plan_size_zero_is_distinct_from_unset() {
        let mut instance =
            StepThreadInstance::new_top_level(top_level_key(), true, StepExecutionId::new());
        instance.set_plan_size(0).unwrap();
        assert_eq!(instance.plan_size(), Some(0));
        assert!(instance.set_plan_size(1).is_err());
    }

    #[test]
    fn plan_size_on_partition_instance_is_rejected() {
        let key = StepThreadKey::partition(JobInstanceId::new(), "load", 2);
        let mut instance = StepThreadInstance::new_partition(key, StepExecutionId::new());
        assert!(instance.set_plan_size(4).is_err());
    }

    #[test]
    fn checkpoint_round_trips_bytes() {
        let mut instance =
            StepThreadInstance::new_top_level(top_level_key(), false, StepExecutionId::new());
        let blob = vec![0u8, 1, 2, 254, 255];
        instance.set_checkpoint(blob.clone());
        assert_eq!(instance.checkpoint.as_deref(), Some(blob.as_slice()));
        instance.clear_checkpoint();
        assert!(instance.checkpoint.is_none());
    }

    #[test]
    fn checkpoint_decodes_lazily() {
        #[derive(serde::Deserialize, Debug)]
        struct Cursor {
            offset: u64,
        }
        let mut instance =
            StepThreadInstance::new_top_level(top_level_key(), false, StepExecutionId::new());
        assert!(instance.checkpoint_as::<Cursor>().unwrap().is_none());

        instance.set_checkpoint(br#"{"offset":9000}"#.to_vec());
        let cursor = instance.checkpoint_as::<Cursor>().unwrap().unwrap();
        assert_eq!(cursor.offset, 9000);

        instance.set_checkpoint(b"\xff\xfe not json".to_vec());
        let err = instance.checkpoint_as::<Cursor>().unwrap_err();
        assert!(matches!(err, DomainError::Decode(_)));
    }

    #[test]
    fn start_count_increments_on_top_level_only() {
        let mut top =
            StepThreadInstance::new_top_level(top_level_key(), true, StepExecutionId::new());
        top.increment_start_count();
        assert_eq!(top.top_level.as_ref().unwrap().start_count, 2);

        let key = StepThreadKey::partition(JobInstanceId::new(), "load", 0);
        let mut part = StepThreadInstance::new_partition(key, StepExecutionId::new());
        part.increment_start_count();
        assert!(part.top_level.is_none());
    }

    #[test]
    fn top_level_execution_references_itself() {
        let exec = StepThreadExecution::new_top_level(
            JobExecutionId::new(),
            "load",
            true,
            Utc::now(),
            Generation::V2,
        );
        assert_eq!(exec.top_level_execution, exec.id);
        assert_eq!(exec.partitioned, Some(true));
        assert_eq!(exec.run_status, RunStatus::Starting);
    }

    #[test]
    fn partition_execution_references_its_top_level() {
        let top = StepThreadExecution::new_top_level(
            JobExecutionId::new(),
            "load",
            true,
            Utc::now(),
            Generation::V2,
        );
        let part = StepThreadExecution::new_partition(
            top.job_execution,
            "load",
            PartitionNumber::partition(3),
            top.id,
            Utc::now(),
            Generation::V2,
        );
        assert_eq!(part.top_level_execution, top.id);
        assert!(part.partitioned.is_none());
        assert!(!part.is_top_level());
    }

    #[test]
    fn step_key_validation_enforces_name_limit() {
        let key = StepThreadKey::top_level(JobInstanceId::new(), "s".repeat(129));
        assert!(key.validate().is_err());
        let key = StepThreadKey::top_level(JobInstanceId::new(), "s".repeat(128));
        assert!(key.validate().is_ok());
    }
}
