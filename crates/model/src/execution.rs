//! Job execution: one run attempt of a job instance.

use chrono::{DateTime, Utc};
use forgebatch_core::limits::truncate_exit_status;
use forgebatch_core::{DomainResult, JobExecutionId, JobInstanceId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::generation::Generation;
use crate::params::JobParameters;
use crate::status::RunStatus;

/// One run attempt of a job instance.
///
/// Created `Queued` when a run is dispatched. The owning-worker fields stay
/// unset until a worker claims the execution; after a terminal status is
/// reached the record is only ever touched by explicit administrative
/// action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance_id: JobInstanceId,
    /// Position within the owning instance: 1, 2, 3, … in creation order.
    /// Unique per instance, assigned atomically at creation.
    pub execution_number: u32,
    pub parameters: JobParameters,
    pub run_status: RunStatus,
    pub exit_status: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Worker currently running this execution; unset until claimed.
    pub worker_id: Option<WorkerId>,
    /// Resolvable callback URL of the owning worker.
    pub rest_url: Option<String>,
    /// Directory holding this execution's job log, once the worker sets it.
    pub log_dir: Option<String>,
    /// Shape generation this record was written at.
    pub generation: Generation,
}

impl JobExecution {
    pub fn new(
        instance_id: JobInstanceId,
        execution_number: u32,
        parameters: JobParameters,
        create_time: DateTime<Utc>,
        generation: Generation,
    ) -> Self {
        Self {
            id: JobExecutionId::new(),
            instance_id,
            execution_number,
            parameters,
            run_status: RunStatus::Queued,
            exit_status: None,
            create_time,
            start_time: None,
            end_time: None,
            last_updated: create_time,
            worker_id: None,
            rest_url: None,
            log_dir: None,
            generation,
        }
    }

    /// Whether `worker` already owns this execution.
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.worker_id.as_ref() == Some(worker)
    }

    /// Record a worker taking ownership: sets the owner fields and moves the
    /// status from `Queued` to `Starting`.
    ///
    /// Callers are expected to have checked ownership beforehand; claiming
    /// is conditional at the store layer.
    pub fn assign_owner(
        &mut self,
        worker: WorkerId,
        rest_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(RunStatus::Starting)?;
        self.worker_id = Some(worker);
        self.rest_url = Some(rest_url.into());
        self.last_updated = now;
        Ok(())
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(RunStatus::Started)?;
        self.start_time = Some(now);
        self.last_updated = now;
        Ok(())
    }

    /// Record an acknowledged stop request. Advisory: the owning worker must
    /// observe it and drive the execution to `Stopped`.
    pub fn mark_stopping(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(RunStatus::Stopping)?;
        self.last_updated = now;
        Ok(())
    }

    /// Apply a plain status transition.
    pub fn set_status(&mut self, status: RunStatus, now: DateTime<Utc>) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(status)?;
        self.last_updated = now;
        Ok(())
    }

    /// Drive the execution to a terminal status with its exit status.
    ///
    /// The exit status is truncated to the persistable limit before it is
    /// recorded.
    pub fn mark_ended(
        &mut self,
        status: RunStatus,
        exit_status: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.run_status = self.run_status.transition_to(status)?;
        self.exit_status = exit_status.map(truncate_exit_status);
        self.end_time = Some(now);
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
    use forgebatch_core::MAX_EXIT_STATUS_LEN;

    fn queued_execution() -> JobExecution {
        JobExecution::new(
            JobInstanceId::new(),
            1,
            JobParameters::new(),
            Utc::now(),
            Generation::V3,
        )
    }

    #[test]
    fn claim_moves_queued_to_starting() {
        let mut exec = queued_execution();
        exec.assign_owner(WorkerId::from("worker-a"), "https://a:9443/batch", Utc::now())
            .unwrap();
        assert_eq!(exec.run_status, RunStatus::Starting);
        assert!(exec.is_owned_by(&WorkerId::from("worker-a")));
        assert_eq!(exec.rest_url.as_deref(), Some("https://a:9443/batch"));
    }

    #[test]
    fn full_lifecycle_to_completed() {
        let mut exec = queued_execution();
        exec.assign_owner(WorkerId::from("worker-a"), "https://a:9443/batch", Utc::now())
            .unwrap();
        exec.mark_started(Utc::now()).unwrap();
        exec.mark_ended(RunStatus::Completed, Some("COMPLETED".into()), Utc::now())
            .unwrap();
        assert!(exec.run_status.is_terminal());
        assert!(exec.start_time.is_some());
        assert!(exec.end_time.is_some());
    }

    #[test]
    fn end_truncates_oversized_exit_status() {
        let mut exec = queued_execution();
        exec.assign_owner(WorkerId::from("worker-a"), "url", Utc::now())
            .unwrap();
        exec.mark_started(Utc::now()).unwrap();
        exec.mark_ended(
            RunStatus::Failed,
            Some("x".repeat(MAX_EXIT_STATUS_LEN * 2)),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            exec.exit_status.as_ref().unwrap().chars().count(),
            MAX_EXIT_STATUS_LEN
        );
    }

    #[test]
    fn cannot_restart_a_terminal_execution() {
        let mut exec = queued_execution();
        exec.assign_owner(WorkerId::from("worker-a"), "url", Utc::now())
            .unwrap();
        exec.mark_started(Utc::now()).unwrap();
        exec.mark_ended(RunStatus::Failed, None, Utc::now()).unwrap();
        assert!(exec.mark_started(Utc::now()).is_err());
    }

    #[test]
    fn stop_request_then_stopped() {
        let mut exec = queued_execution();
        exec.assign_owner(WorkerId::from("worker-a"), "url", Utc::now())
            .unwrap();
        exec.mark_started(Utc::now()).unwrap();
        exec.mark_stopping(Utc::now()).unwrap();
        exec.mark_ended(RunStatus::Stopped, None, Utc::now()).unwrap();
        assert_eq!(exec.run_status, RunStatus::Stopped);
    }
}
