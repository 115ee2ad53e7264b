//! Evaluation entity (§3, §6, §7).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Complete,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TriggerReason {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    Periodic,
    RollingUpdate,
    Disconnect,
    Reschedule,
    QueuedAllocsBlocked,
}

/// Per-dimension exhaustion reasons (§4.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display)]
pub enum DimensionExhausted {
    #[strum(serialize = "cpu")]
    Cpu,
    #[strum(serialize = "memory")]
    Memory,
    #[strum(serialize = "disk")]
    Disk,
    #[strum(serialize = "network: port collision")]
    NetworkPortCollision,
    #[strum(serialize = "network: bandwidth exceeded")]
    NetworkBandwidthExceeded,
    #[strum(serialize = "network: invalid node")]
    NetworkInvalidNode,
    #[strum(serialize = "devices: no devices match request")]
    DevicesNoMatch,
    #[strum(serialize = "max allocations")]
    MaxAllocations,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedTaskGroupAllocs {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_in_pool: u32,
    pub nodes_available_by_dc: BTreeMap<String, u32>,
    pub class_filtered: BTreeMap<String, u32>,
    pub constraint_filtered: BTreeMap<String, u32>,
    pub dimension_exhausted: BTreeMap<String, u32>,
    pub coalesced_failures: u32,
    pub allocation_time: std::time::Duration,
}

/// The minimal resource ask that failed, kept on a blocked evaluation so a
/// later node-update can cheaply decide if it's worth retrying (SPEC_FULL
/// §C.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockedEvalClass {
    pub cpu_shares: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub namespace: String,
    pub job_id: String,
    pub priority: i32,
    pub trigger: TriggerReason,
    pub node_id: Option<Uuid>,
    pub status: EvalStatus,
    pub next_eval: Option<Uuid>,
    pub previous_eval: Option<Uuid>,
    pub blocked_eval: Option<Uuid>,
    pub queued_allocations: BTreeMap<String, u32>,
    pub failed_tg_allocs: BTreeMap<String, FailedTaskGroupAllocs>,
    pub blocked_eval_class: Option<BlockedEvalClass>,
    /// When this evaluation was deliberately staggered (§4.5.4 rolling
    /// update, or §4.5.2 reschedule-later), the wall-clock time it becomes
    /// eligible for processing.
    pub wait_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl Evaluation {
    pub fn new(namespace: impl Into<String>, job_id: impl Into<String>, priority: i32, trigger: TriggerReason) -> Self {
        Evaluation {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            job_id: job_id.into(),
            priority,
            trigger,
            node_id: None,
            status: EvalStatus::Pending,
            next_eval: None,
            previous_eval: None,
            blocked_eval: None,
            queued_allocations: BTreeMap::new(),
            failed_tg_allocs: BTreeMap::new(),
            blocked_eval_class: None,
            wait_until: None,
        }
    }

    pub fn follow_up(&self, trigger: TriggerReason, wait_until: Option<chrono::DateTime<chrono::Utc>>) -> Evaluation {
        let mut eval = Evaluation::new(self.namespace.clone(), self.job_id.clone(), self.priority, trigger);
        eval.previous_eval = Some(self.id);
        eval.wait_until = wait_until;
        eval
    }
}
