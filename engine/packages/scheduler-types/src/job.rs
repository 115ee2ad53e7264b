//! Job entity and task-group/task structures (§3).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constraint::{Affinity, Constraint};
use crate::resources::{NetworkRequest, TaskResources};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
    Sysbatch,
}

impl JobType {
    /// System and sysbatch place one allocation per eligible node rather
    /// than `count` placements (§3 Job invariant, §4.5.5).
    pub fn is_system_like(self) -> bool {
        matches!(self, JobType::System | JobType::Sysbatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobVersion(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub namespace: String,
    pub id: String,
    pub version: JobVersion,
    pub job_type: JobType,
    pub priority: i32,
    pub create_index: u64,
    pub datacenters: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub task_groups: Vec<TaskGroup>,
    pub stop: bool,
}

impl Job {
    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescheduleDelayFunction {
    Constant,
    Exponential,
    Fibonacci,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub delay: Duration,
    pub delay_function: RescheduleDelayFunction,
    pub max_delay: Duration,
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        ReschedulePolicy {
            attempts: 2,
            interval: Duration::from_secs(3600),
            delay: Duration::from_secs(30),
            delay_function: RescheduleDelayFunction::Exponential,
            max_delay: Duration::from_secs(3600),
            unlimited: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectStrategy {
    pub lost_after: Duration,
    pub replace: bool,
    pub reconcile: DisconnectReconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReconcile {
    BestScore,
    KeepOriginal,
    KeepReplacement,
    LongestRunning,
}

impl Default for DisconnectStrategy {
    fn default() -> Self {
        DisconnectStrategy {
            lost_after: Duration::from_secs(0),
            replace: true,
            reconcile: DisconnectReconcile::KeepReplacement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    pub stagger: Duration,
    pub max_parallel: u32,
    pub health_check: HealthCheck,
    pub min_healthy_time: Duration,
    pub healthy_deadline: Duration,
    pub auto_revert: bool,
    pub canary: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheck {
    TaskStates,
    Checks,
    Manual,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        UpdateStrategy {
            stagger: Duration::from_secs(30),
            max_parallel: 0,
            health_check: HealthCheck::TaskStates,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(300),
            auto_revert: false,
            canary: 0,
        }
    }
}

impl UpdateStrategy {
    pub fn is_rolling(&self) -> bool {
        self.max_parallel > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostVolumeRequest {
    pub name: String,
    pub source: String,
    /// Per-allocation host volumes are interpolated as `<source>[<idx>]`
    /// using the allocation's task-group index (§4.2 step 5).
    pub per_alloc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiVolumeRequest {
    pub name: String,
    pub volume_id: String,
    pub plugin_id: String,
    pub required_topology_segments: Vec<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    pub resources: TaskResources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub constraints: Vec<Constraint>,
    pub affinities: Vec<Affinity>,
    pub update: Option<UpdateStrategy>,
    pub disconnect: Option<DisconnectStrategy>,
    pub reschedule: ReschedulePolicy,
    pub ephemeral_disk_mb: u64,
    pub host_volumes: Vec<HostVolumeRequest>,
    pub csi_volumes: Vec<CsiVolumeRequest>,
    pub networks: Vec<NetworkRequest>,
    pub tasks: Vec<Task>,
    /// Content hash of the `{driver, user, config}` surface that cannot be
    /// updated in place; a change here forces a destructive update (§4.5.3).
    pub destructive_hash: u64,
    /// Content hash of the in-place-updatable surface (env, services,
    /// templates) (§4.5.3).
    pub inplace_hash: u64,
}

impl TaskGroup {
    pub fn max_parallel(&self) -> u32 {
        self.update.as_ref().map(|u| u.max_parallel).unwrap_or(0)
    }

    pub fn canary_count(&self) -> u32 {
        self.update.as_ref().map(|u| u.canary).unwrap_or(0)
    }
}
