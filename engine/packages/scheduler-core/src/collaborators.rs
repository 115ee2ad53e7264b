//! External collaborator contracts (§6): `Snapshot`, `Planner`,
//! `IdentitySigner`, `RescheduleClock`. The core depends only on these
//! traits; an embedding agent process wires in raft storage and RPC.

use std::sync::Arc;

use async_trait::async_trait;
use scheduler_types::{Allocation, Job, Node, Plan};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// CSI volume usage as seen from the snapshot, enough for the feasibility
/// chain's plugin headroom check (§4.2 step 6).
#[derive(Debug, Clone)]
pub struct CsiVolumeInfo {
    pub plugin_id: String,
    pub allocations_in_use: u32,
}

/// A consistent, point-in-time read of cluster state (§6). Every method on
/// one `Snapshot` value observes the same raft index.
#[async_trait]
pub trait Snapshot: Send + Sync {
    async fn nodes(&self) -> Result<Vec<Arc<Node>>, SchedulerError>;
    async fn node_by_id(&self, id: Uuid) -> Result<Option<Arc<Node>>, SchedulerError>;
    async fn allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> Result<Vec<Allocation>, SchedulerError>;
    async fn allocs_by_node(&self, node_id: Uuid) -> Result<Vec<Allocation>, SchedulerError>;
    async fn allocs(&self) -> Result<Vec<Allocation>, SchedulerError>;
    async fn job_by_id(&self, namespace: &str, job_id: &str) -> Result<Option<Arc<Job>>, SchedulerError>;
    async fn csi_volumes_by_id(&self, namespace: &str, volume_id: &str) -> Result<Option<CsiVolumeInfo>, SchedulerError>;
    fn scheduler_config(&self) -> SchedulerConfig;
    fn index(&self, table: &str) -> u64;
}

/// Obtains a fresh `Snapshot`; called at step 1 of §4.6 and again at each
/// planner-rejection retry (a fresh snapshot at minimum quorum index).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Arc<dyn Snapshot>, SchedulerError>;
}

#[derive(Debug, Clone)]
pub struct PlannerSubmission {
    /// The subset of the submitted plan's placements/updates actually
    /// applied; conflicts are resolved by raft and may shrink this.
    pub accepted: Plan,
    pub raft_index: u64,
}

/// The sole mutator of authoritative cluster state (§5, §6). May reject a
/// submission on optimistic-concurrency conflict, which the driver retries.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn submit(&self, plan: Plan) -> Result<PlannerSubmission, SchedulerError>;
}

/// Workload identity claims signed after placement; pure and side-effect
/// free on the scheduling decision itself (§6).
pub trait IdentitySigner: Send + Sync {
    fn sign(&self, claims: &str) -> Result<String, SchedulerError>;
}

/// Deterministic-in-tests wall clock (§6), consumed by reschedule-delay
/// computation and blocked-evaluation wakeups.
pub trait RescheduleClock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

/// The real collaborator; test doubles substitute a fixed or stepped clock.
pub struct SystemClock;

impl RescheduleClock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}
