//! Scheduler configuration shape (§B). Loading config from file/env is out
//! of scope (§1 Non-goals); this is read from `Snapshot::scheduler_config()`.

use std::time::Duration;

use scheduler_types::JobType;

/// Preemption priority gap, per scheduler type (§4.7 step 1: "gap depends
/// on scheduler type"). System/sysbatch schedulers preempt more eagerly
/// than service/batch, mirroring the teacher's per-class tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptMinGap {
    pub service: i32,
    pub batch: i32,
    pub system: i32,
    pub sysbatch: i32,
}

impl Default for PreemptMinGap {
    fn default() -> Self {
        PreemptMinGap { service: 10, batch: 10, system: 0, sysbatch: 0 }
    }
}

impl PreemptMinGap {
    pub fn for_job_type(&self, job_type: JobType) -> i32 {
        match job_type {
            JobType::Service => self.service,
            JobType::Batch => self.batch,
            JobType::System => self.system,
            JobType::Sysbatch => self.sysbatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedEvalPolicy {
    /// How many times a blocked evaluation may be retried before it is
    /// abandoned (the node-update trigger that wakes it counts separately).
    pub max_retries: u32,
}

impl Default for BlockedEvalPolicy {
    fn default() -> Self {
        BlockedEvalPolicy { max_retries: 10 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub default_stagger: Duration,
    pub preempt_min_gap: PreemptMinGap,
    /// §4.6 step 6: bounded retry count on `PlannerRejected` (optimistic
    /// concurrency conflict), e.g. 5 per §7.
    pub planner_retry_limit: u32,
    pub planner_retry_backoff: Duration,
    pub snapshot_deadline: Duration,
    pub planner_deadline: Duration,
    pub blocked_eval_policy: BlockedEvalPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            default_stagger: Duration::from_secs(30),
            preempt_min_gap: PreemptMinGap::default(),
            planner_retry_limit: 5,
            planner_retry_backoff: Duration::from_millis(50),
            snapshot_deadline: Duration::from_secs(5),
            planner_deadline: Duration::from_secs(5),
            blocked_eval_policy: BlockedEvalPolicy::default(),
        }
    }
}
