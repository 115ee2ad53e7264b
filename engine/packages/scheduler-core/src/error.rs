//! Scheduler error kinds (§7). `InvariantViolation` is the only kind that
//! unwinds a thread; every other kind is returned and handled by the driver.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("job {namespace}/{job_id} not found")]
    JobNotFound { namespace: String, job_id: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("no feasible node for task group {task_group} in eval {eval_id}")]
    NoFeasibleNode { eval_id: Uuid, task_group: String },

    #[error("preemption infeasible for task group {task_group} on node {node_id}")]
    PreemptionInfeasible { node_id: Uuid, task_group: String },

    #[error("planner rejected plan for eval {eval_id} after {attempts} attempts")]
    PlannerRejected { eval_id: Uuid, attempts: u32 },

    #[error("timed out waiting on {operation}")]
    Timeout { operation: &'static str },
}

impl SchedulerError {
    /// Constructs an `InvariantViolation` and panics with it (§7, §8):
    /// constraint math, index bounds, or bitmap duplicates disagreeing is
    /// programmer error, never a recoverable runtime condition.
    #[track_caller]
    pub fn invariant_violation(message: impl Into<String>) -> ! {
        panic!("{}", SchedulerError::InvariantViolation(message.into()));
    }
}
