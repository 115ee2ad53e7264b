//! Per-task resource asks and per-node resource accounting value types
//! (§3, §4.1).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// CPU can be requested as a fungible share count or as a set of reserved
/// cores; a task never specifies both (§3 Task invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpuRequest {
    /// Fungible CPU shares (milli-cpu-equivalent integer units).
    Shares(u32),
    /// Reserved physical cores, with a NUMA affinity policy.
    Cores {
        count: u32,
        numa: NumaAffinity,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumaAffinity {
    None,
    Prefer,
    Require,
}

/// Memory has a soft floor (`memory`) and, when `memory_max` is set, a hard
/// ceiling above it (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequest {
    pub memory_mb: u64,
    /// `None` means "no hard limit above the soft floor" — the sentinel
    /// described in §4.1 for drivers that treat `memory` as a pure minimum.
    pub memory_max_mb: Option<u64>,
}

impl MemoryRequest {
    pub fn hard_ceiling_mb(&self) -> Option<u64> {
        self.memory_max_mb
    }

    pub fn soft_floor_mb(&self) -> u64 {
        self.memory_mb
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub vendor: String,
    pub kind: String,
    pub name: String,
    pub count: u32,
    pub affinities: Vec<DeviceAffinity>,
}

impl DeviceRequest {
    pub fn id(&self) -> DeviceClassId {
        DeviceClassId {
            vendor: self.vendor.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceClassId {
    pub vendor: String,
    pub kind: String,
    pub name: String,
}

impl std::fmt::Display for DeviceClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vendor, self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAffinity {
    pub ltarget: String,
    pub operand: crate::constraint::ConstraintOperand,
    pub rtarget: String,
    pub weight: i32,
}

/// A static or dynamic port request on an optionally-named host network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRequest {
    pub label: String,
    /// `Some` for a static port; `None` requests a dynamic port.
    pub value: Option<u16>,
    /// Host network alias; `None` means the node's default address.
    pub host_network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub mbits: u32,
    pub ports: Vec<PortRequest>,
}

/// Full resource ask for a single task (§3 Task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    pub cpu: CpuRequest,
    pub memory: MemoryRequest,
    pub disk_mb: u64,
    pub devices: Vec<DeviceRequest>,
    pub networks: Vec<NetworkRequest>,
}

/// The totals a node advertises, before subtracting `reserved` (§3 Node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu_shares: u32,
    /// Reservable core ids, grouped by NUMA node.
    pub cores_by_numa_node: BTreeMap<u32, BTreeSet<u32>>,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub host_networks: Vec<HostNetwork>,
    pub devices: Vec<NodeDeviceGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostNetwork {
    pub alias: String,
    pub address: String,
    /// Ports reserved out of band (e.g. by the host OS); these are never
    /// offered to placement and never considered collisions.
    pub reserved_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeviceGroup {
    pub vendor: String,
    pub kind: String,
    pub name: String,
    pub instance_ids: Vec<String>,
}

/// Committed resources for one allocation, split by task plus the
/// task-group-shared ephemeral disk (§3 Allocation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedResources {
    pub tasks: BTreeMap<String, TaskResources>,
    pub shared_disk_mb: u64,
    /// Device instance ids committed per requested device class, filled in
    /// by `DeviceAllocator::commit` (§4.1).
    pub device_instance_ids: BTreeMap<DeviceClassId, Vec<String>>,
    /// Reserved core ids committed per task, when the task used
    /// `CpuRequest::Cores` (§4.1).
    pub core_ids: BTreeMap<String, BTreeSet<u32>>,
}

impl AllocatedResources {
    pub fn total_cpu_shares(&self) -> u32 {
        self.tasks
            .values()
            .map(|t| match &t.cpu {
                CpuRequest::Shares(s) => *s,
                CpuRequest::Cores { .. } => 0,
            })
            .sum()
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.tasks.values().map(|t| t.memory.memory_mb).sum()
    }
}
