//! Allocation entity, reschedule tracker and alloc-state history (§3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobVersion;
use crate::resources::AllocatedResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

impl ClientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientStatus::Complete | ClientStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTransition {
    pub migrate: bool,
    pub reschedule: bool,
    pub force_reschedule: bool,
    pub no_shutdown_delay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescheduleOutcome {
    /// Placed immediately this evaluation.
    RescheduledNow,
    /// Scheduled for a future evaluation.
    RescheduledLater,
    /// Policy exhausted: no further attempts will be made.
    AttemptedToPlace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
    pub prev_alloc_id: uuid::Uuid,
    pub prev_node_id: uuid::Uuid,
    pub delay: std::time::Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RescheduleTracker {
    pub events: Vec<RescheduleEvent>,
    pub last_outcome: Option<RescheduleOutcome>,
}

/// One timestamped client-status transition, used for disconnect/reconnect
/// reasoning (§4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStateTransition {
    pub time: DateTime<Utc>,
    pub status: ClientStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: uuid::Uuid,
    pub namespace: String,
    pub job_id: String,
    pub job_version: JobVersion,
    pub node_id: uuid::Uuid,
    pub task_group: String,
    pub index: u32,
    pub name: String,
    pub resources: AllocatedResources,
    pub desired_status: DesiredStatus,
    pub client_status: ClientStatus,
    pub desired_transition: DesiredTransition,
    pub previous_allocation: Option<uuid::Uuid>,
    pub next_allocation: Option<uuid::Uuid>,
    /// Set for allocations placed as part of a canary rollout, ahead of the
    /// full destructive update (§4.5.3, §4.5.4).
    pub is_canary: bool,
    /// The owning task group's `destructive_hash`/`inplace_hash` at the time
    /// this allocation was placed, so a later reconcile can tell in-place
    /// changes from destructive ones without re-reading historical job
    /// versions (§4.5.3).
    pub destructive_hash: u64,
    pub inplace_hash: u64,
    pub reschedule_tracker: RescheduleTracker,
    /// Append-only, monotone-timestamp history of client status transitions.
    pub alloc_states: Vec<AllocStateTransition>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    pub fn indexed_name(job_id: &str, task_group: &str, index: u32) -> String {
        format!("{job_id}.{task_group}[{index}]")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.desired_status, DesiredStatus::Stop | DesiredStatus::Evict)
            || self.client_status.is_terminal()
    }

    pub fn is_running_like(&self) -> bool {
        matches!(self.desired_status, DesiredStatus::Run)
            && matches!(
                self.client_status,
                ClientStatus::Pending | ClientStatus::Running | ClientStatus::Unknown
            )
    }

    pub fn last_alloc_state(&self) -> Option<AllocStateTransition> {
        self.alloc_states.last().copied()
    }
}
