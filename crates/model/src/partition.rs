//! Remotable partitions: cross-worker partition ownership records.

use chrono::{DateTime, Utc};
use forgebatch_core::{DomainError, DomainResult, JobExecutionId, StepExecutionId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::step::PartitionNumber;

/// Composite key of a remotable partition record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub job_execution: JobExecutionId,
    pub step_name: String,
    pub partition: PartitionNumber,
}

impl PartitionKey {
    pub fn new(
        job_execution: JobExecutionId,
        step_name: impl Into<String>,
        partition_number: u32,
    ) -> Self {
        Self {
            job_execution,
            step_name: step_name.into(),
            partition: PartitionNumber::partition(partition_number),
        }
    }
}

impl core::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.job_execution, self.step_name, self.partition
        )
    }
}

/// Internal state of a remotable partition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    /// Created, awaiting pickup by a worker.
    Queued,
    /// A worker took the dispatch and is running it remotely.
    Dispatched,
    Completed,
    /// The original owner was presumed dead and the partition has been (or
    /// will be) reassigned. One-way.
    Recovered,
}

impl PartitionState {
    fn name(&self) -> &'static str {
        match self {
            PartitionState::Queued => "QUEUED",
            PartitionState::Dispatched => "DISPATCHED",
            PartitionState::Completed => "COMPLETED",
            PartitionState::Recovered => "RECOVERED",
        }
    }

    pub fn can_transition_to(&self, next: PartitionState) -> bool {
        use PartitionState::*;
        if *self == next {
            return true;
        }
        match self {
            Queued => matches!(next, Dispatched | Recovered),
            Dispatched => matches!(next, Completed | Recovered),
            Completed => false,
            Recovered => false,
        }
    }

    pub fn transition_to(&self, next: PartitionState) -> DomainResult<PartitionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition {
                from: self.name(),
                to: next.name(),
            })
        }
    }
}

impl core::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Cross-worker ownership record for a partition that may run on a worker
/// other than the one driving the step's top-level thread.
///
/// At most one live (non-recovered) record exists per key. Marking a record
/// recovered supersedes it; the prior step thread execution stays untouched
/// as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotablePartition {
    pub key: PartitionKey,
    pub state: PartitionState,
    pub worker_id: Option<WorkerId>,
    pub rest_url: Option<String>,
    /// The corresponding step thread execution, linked once dispatch
    /// completes. Absent when the dispatcher predates partition records.
    pub step_execution: Option<StepExecutionId>,
    pub last_updated: DateTime<Utc>,
    pub log_dir: Option<String>,
}

impl RemotablePartition {
    /// Create a queued record ahead of dispatching the partition.
    pub fn new_queued(key: PartitionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            state: PartitionState::Queued,
            worker_id: None,
            rest_url: None,
            step_execution: None,
            last_updated: now,
            log_dir: None,
        }
    }

    /// Record a worker taking the dispatch, linking the step thread
    /// execution it created.
    pub fn mark_dispatched(
        &mut self,
        worker: WorkerId,
        rest_url: impl Into<String>,
        step_execution: StepExecutionId,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.state = self.state.transition_to(PartitionState::Dispatched)?;
        self.worker_id = Some(worker);
        self.rest_url = Some(rest_url.into());
        self.step_execution = Some(step_execution);
        self.last_updated = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.state = self.state.transition_to(PartitionState::Completed)?;
        self.last_updated = now;
        Ok(())
    }

    /// One-way transition recording that the owner is presumed dead.
    ///
    /// Recovering an already-recovered record is a no-op: two workers racing
    /// the same recovery must both succeed (the loser's write supersedes
    /// harmlessly).
    pub fn mark_recovered(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state == PartitionState::Recovered {
            return Ok(());
        }
        self.state = self.state.transition_to(PartitionState::Recovered)?;
        self.last_updated = now;
        Ok(())
    }

    pub fn set_log_dir(&mut self, log_dir: impl Into<String>, now: DateTime<Utc>) {
        self.log_dir = Some(log_dir.into());
        self.last_updated = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> RemotablePartition {
        let key = PartitionKey::new(JobExecutionId::new(), "load", 2);
        RemotablePartition::new_queued(key, Utc::now())
    }

    #[test]
    fn dispatch_links_worker_and_execution() {
        let mut partition = queued();
        let step_exec = StepExecutionId::new();
        partition
            .mark_dispatched(WorkerId::from("worker-b"), "https://b:9443/batch", step_exec, Utc::now())
            .unwrap();
        assert_eq!(partition.state, PartitionState::Dispatched);
        assert_eq!(partition.step_execution, Some(step_exec));
        assert_eq!(partition.worker_id, Some(WorkerId::from("worker-b")));
    }

    #[test]
    fn recovery_is_one_way() {
        let mut partition = queued();
        partition.mark_recovered(Utc::now()).unwrap();
        assert_eq!(partition.state, PartitionState::Recovered);
        assert!(!partition
            .state
            .can_transition_to(PartitionState::Dispatched));
        assert!(!partition.state.can_transition_to(PartitionState::Completed));
    }

    #[test]
    fn double_recovery_is_tolerated() {
        let mut partition = queued();
        partition.mark_recovered(Utc::now()).unwrap();
        // Second recovery write from a racing worker: harmless.
        partition.mark_recovered(Utc::now()).unwrap();
        assert_eq!(partition.state, PartitionState::Recovered);
    }

    #[test]
    fn completed_partition_cannot_be_recovered() {
        let mut partition = queued();
        partition
            .mark_dispatched(WorkerId::from("worker-b"), "url", StepExecutionId::new(), Utc::now())
            .unwrap();
        partition.mark_completed(Utc::now()).unwrap();
        assert!(partition.mark_recovered(Utc::now()).is_err());
    }
}
