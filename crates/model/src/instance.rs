//! Job instance: the durable identity of a submitted job.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use forgebatch_core::{DomainResult, JobInstanceId};
use serde::{Deserialize, Serialize};

use crate::generation::Generation;
use crate::status::{InstanceState, RunStatus};

/// Durable identity of a submitted job, spanning all of its run attempts.
///
/// Created once at submission and mutated on every execution start/end;
/// never deleted by the registry itself (purge is an administrative
/// operation). The `latest_run_status` / `exit_status` pair is a
/// denormalized copy of the most recent execution's values, kept so that
/// list views never need a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    /// Name of the application that submitted the job.
    pub app_name: Option<String>,
    pub job_name: String,
    pub submitter: String,
    /// The job definition blob (XML), if it was captured at submission.
    pub job_definition: Option<String>,
    pub instance_state: InstanceState,
    pub latest_run_status: RunStatus,
    pub exit_status: Option<String>,
    /// Step name a restart should resume from, when one was recorded.
    pub restart_on: Option<String>,
    /// Number of executions ever created for this instance. Only increases.
    pub num_executions: u32,
    pub create_time: DateTime<Utc>,
    /// Present from [`Generation::V2`] onward.
    pub last_updated: Option<DateTime<Utc>>,
    /// Group/authorization names. Present from [`Generation::V3`] onward.
    pub group_names: Option<BTreeSet<String>>,
    /// Shape generation this record was written at.
    pub generation: Generation,
}

impl JobInstance {
    /// Create a freshly submitted instance.
    pub fn new(
        job_name: impl Into<String>,
        submitter: impl Into<String>,
        job_definition: Option<String>,
        create_time: DateTime<Utc>,
        generation: Generation,
    ) -> Self {
        Self {
            id: JobInstanceId::new(),
            app_name: None,
            job_name: job_name.into(),
            submitter: submitter.into(),
            job_definition,
            instance_state: InstanceState::Submitted,
            latest_run_status: RunStatus::Queued,
            exit_status: None,
            restart_on: None,
            num_executions: 0,
            create_time,
            last_updated: Some(create_time),
            group_names: None,
            generation,
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Transition the instance-level state, validating against the state
    /// machine.
    pub fn set_state(&mut self, state: InstanceState, now: DateTime<Utc>) -> DomainResult<()> {
        self.instance_state = self.instance_state.transition_to(state)?;
        self.touch(now);
        Ok(())
    }

    /// Transition state and the denormalized run status together.
    pub fn set_state_and_status(
        &mut self,
        state: InstanceState,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.instance_state = self.instance_state.transition_to(state)?;
        self.latest_run_status = status;
        self.touch(now);
        Ok(())
    }

    /// Record the denormalized run status of the latest execution.
    pub fn set_latest_run_status(&mut self, status: RunStatus, now: DateTime<Utc>) {
        self.latest_run_status = status;
        self.touch(now);
    }

    /// Fold a finished execution's terminal status back into the instance.
    ///
    /// The instance state mirrors the terminal run status (a completed
    /// execution settles the instance as completed, and so on). Non-final
    /// statuses only update the denormalized copy.
    pub fn record_execution_end(
        &mut self,
        status: RunStatus,
        exit_status: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let settled = match status {
            RunStatus::Completed => Some(InstanceState::Completed),
            RunStatus::Stopped => Some(InstanceState::Stopped),
            RunStatus::Failed => Some(InstanceState::Failed),
            RunStatus::Abandoned => Some(InstanceState::Abandoned),
            _ => None,
        };
        if let Some(state) = settled {
            self.instance_state = self.instance_state.transition_to(state)?;
        }
        self.latest_run_status = status;
        self.exit_status = exit_status;
        self.touch(now);
        Ok(())
    }

    /// Resubmit a stopped or failed instance for a restart execution.
    pub fn mark_resubmitted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.instance_state = self.instance_state.transition_to(InstanceState::Submitted)?;
        self.latest_run_status = RunStatus::Queued;
        self.touch(now);
        Ok(())
    }

    /// Clear generation-gated fields this record's shape cannot carry.
    ///
    /// Called by stores on write so a record persisted at an older
    /// generation never smuggles newer fields.
    pub fn mask_to_generation(&mut self) {
        if !self.generation.at_least(Generation::V2) {
            self.last_updated = None;
        }
        if !self.generation.at_least(Generation::V3) {
            self.group_names = None;
        }
    }

    /// Refresh the last-updated time (a no-op for records whose shape
    /// predates the field).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.generation.at_least(Generation::V2) {
            self.last_updated = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted_instance() -> JobInstance {
        JobInstance::new(
            "nightly-load",
            "ops",
            Some("<job id=\"nightly-load\"/>".to_string()),
            Utc::now(),
            Generation::V3,
        )
    }

    #[test]
    fn new_instance_starts_submitted_and_queued() {
        let instance = submitted_instance();
        assert_eq!(instance.instance_state, InstanceState::Submitted);
        assert_eq!(instance.latest_run_status, RunStatus::Queued);
        assert_eq!(instance.num_executions, 0);
    }

    #[test]
    fn execution_end_settles_the_instance() {
        let mut instance = submitted_instance();
        instance
            .set_state(InstanceState::Dispatched, Utc::now())
            .unwrap();
        instance
            .record_execution_end(RunStatus::Failed, Some("step 2 blew up".into()), Utc::now())
            .unwrap();
        assert_eq!(instance.instance_state, InstanceState::Failed);
        assert_eq!(instance.latest_run_status, RunStatus::Failed);
        assert!(instance.instance_state.is_restartable());
    }

    #[test]
    fn resubmit_after_failure() {
        let mut instance = submitted_instance();
        instance
            .set_state(InstanceState::Dispatched, Utc::now())
            .unwrap();
        instance
            .record_execution_end(RunStatus::Failed, None, Utc::now())
            .unwrap();
        instance.mark_resubmitted(Utc::now()).unwrap();
        assert_eq!(instance.instance_state, InstanceState::Submitted);
        assert_eq!(instance.latest_run_status, RunStatus::Queued);
    }

    #[test]
    fn resubmit_of_in_flight_instance_is_rejected() {
        let mut instance = submitted_instance();
        instance
            .set_state(InstanceState::Dispatched, Utc::now())
            .unwrap();
        assert!(instance.mark_resubmitted(Utc::now()).is_err());
    }

    #[test]
    fn v1_mask_drops_later_generation_fields() {
        let mut instance = submitted_instance();
        instance.generation = Generation::V1;
        instance.group_names = Some(["admins".to_string()].into_iter().collect());
        instance.mask_to_generation();
        assert!(instance.last_updated.is_none());
        assert!(instance.group_names.is_none());
    }

    #[test]
    fn v2_keeps_last_updated_but_not_groups() {
        let mut instance = submitted_instance();
        instance.generation = Generation::V2;
        instance.group_names = Some(["admins".to_string()].into_iter().collect());
        instance.mask_to_generation();
        assert!(instance.last_updated.is_some());
        assert!(instance.group_names.is_none());
    }
}
