//! Status machines for jobs, executions, step threads, and partitions.

use forgebatch_core::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

/// Run status of a job execution or step thread execution.
///
/// Executions are created `Queued`, move to `Starting` when a worker claims
/// them, and end in exactly one of the terminal statuses. `Stopping` records
/// an acknowledged stop request that the owning worker has not yet honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    /// Administrative write-off of a terminal execution.
    Abandoned,
}

/// Statuses counted as "in flight" for ownership and recovery queries.
pub const RUNNING_STATUSES: [RunStatus; 3] =
    [RunStatus::Starting, RunStatus::Started, RunStatus::Stopping];

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Failed | RunStatus::Completed | RunStatus::Abandoned
        )
    }

    pub fn is_running(&self) -> bool {
        RUNNING_STATUSES.contains(self)
    }

    fn name(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Starting => "STARTING",
            RunStatus::Started => "STARTED",
            RunStatus::Stopping => "STOPPING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Failed => "FAILED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Abandoned => "ABANDONED",
        }
    }

    /// Check a transition without applying it.
    ///
    /// Self-transitions are allowed (status writes are retried and must be
    /// idempotent). Terminal statuses admit only the administrative
    /// `Abandoned` write.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Queued => matches!(next, Starting | Stopping | Stopped | Failed),
            Starting => matches!(next, Started | Stopping | Stopped | Failed),
            Started => matches!(next, Completed | Stopping | Stopped | Failed),
            Stopping => matches!(next, Stopped | Failed | Completed),
            Stopped | Failed | Completed => matches!(next, Abandoned),
            Abandoned => false,
        }
    }

    /// Validate and return the new status, or an illegal-transition error.
    pub fn transition_to(&self, next: RunStatus) -> DomainResult<RunStatus> {
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

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Instance-level lifecycle state.
///
/// Coarser than, and deliberately decoupled from, the run status of any one
/// execution: a completed execution can leave the instance restartable if
/// the step sequence did not finish, and a stopped or failed instance may be
/// resubmitted for a further execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Submitted,
    /// Placed on the dispatch queue, awaiting pickup.
    Queued,
    /// Taken off the dispatch queue by a worker, not yet running.
    Consumed,
    Dispatched,
    Completed,
    Stopped,
    Failed,
    Abandoned,
}

impl InstanceState {
    /// States from which no further execution will be created without an
    /// explicit restart.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed
                | InstanceState::Stopped
                | InstanceState::Failed
                | InstanceState::Abandoned
        )
    }

    /// A settled instance that may still be restarted.
    pub fn is_restartable(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    fn name(&self) -> &'static str {
        match self {
            InstanceState::Submitted => "SUBMITTED",
            InstanceState::Queued => "QUEUED",
            InstanceState::Consumed => "CONSUMED",
            InstanceState::Dispatched => "DISPATCHED",
            InstanceState::Completed => "COMPLETED",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Failed => "FAILED",
            InstanceState::Abandoned => "ABANDONED",
        }
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        if *self == next {
            return true;
        }
        match self {
            Submitted => matches!(next, Queued | Consumed | Dispatched | Stopped | Failed),
            Queued => matches!(next, Consumed | Dispatched | Stopped | Failed),
            Consumed => matches!(next, Dispatched | Stopped | Failed),
            Dispatched => matches!(next, Completed | Stopped | Failed),
            // Restart resubmits a stopped/failed instance.
            Stopped | Failed => matches!(next, Submitted | Abandoned),
            Completed => matches!(next, Abandoned),
            Abandoned => false,
        }
    }

    pub fn transition_to(&self, next: InstanceState) -> DomainResult<InstanceState> {
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

impl core::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_happy_path() {
        let mut status = RunStatus::Queued;
        for next in [
            RunStatus::Starting,
            RunStatus::Started,
            RunStatus::Completed,
        ] {
            status = status.transition_to(next).unwrap();
        }
        assert!(status.is_terminal());
    }

    #[test]
    fn stop_request_path() {
        assert!(RunStatus::Started.can_transition_to(RunStatus::Stopping));
        assert!(RunStatus::Stopping.can_transition_to(RunStatus::Stopped));
        // A stop request may still lose to normal completion.
        assert!(RunStatus::Stopping.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn terminal_statuses_only_admit_abandon() {
        for terminal in [RunStatus::Stopped, RunStatus::Failed, RunStatus::Completed] {
            assert!(terminal.can_transition_to(RunStatus::Abandoned));
            assert!(!terminal.can_transition_to(RunStatus::Started));
            assert!(!terminal.can_transition_to(RunStatus::Queued));
        }
        assert!(!RunStatus::Abandoned.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn self_transitions_are_idempotent() {
        assert!(RunStatus::Started.can_transition_to(RunStatus::Started));
        assert!(InstanceState::Dispatched.can_transition_to(InstanceState::Dispatched));
    }

    #[test]
    fn illegal_run_transition_reports_both_ends() {
        let err = RunStatus::Completed
            .transition_to(RunStatus::Started)
            .unwrap_err();
        assert_eq!(
            err,
            forgebatch_core::DomainError::IllegalTransition {
                from: "COMPLETED",
                to: "STARTED"
            }
        );
    }

    #[test]
    fn instance_restart_resubmits_only_stopped_or_failed() {
        assert!(InstanceState::Stopped.can_transition_to(InstanceState::Submitted));
        assert!(InstanceState::Failed.can_transition_to(InstanceState::Submitted));
        assert!(!InstanceState::Completed.can_transition_to(InstanceState::Submitted));
        assert!(!InstanceState::Dispatched.can_transition_to(InstanceState::Submitted));
    }

    #[test]
    fn running_statuses_match_terminality() {
        for status in RUNNING_STATUSES {
            assert!(!status.is_terminal());
        }
    }
}
