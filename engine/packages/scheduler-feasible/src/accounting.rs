//! C1 — per-node live resource accounting (§4.1).

use scheduler_types::{
    Allocation, AllocatedResources, CpuRequest, DimensionExhausted, Node, NumaAffinity, TaskResources,
};
use std::collections::BTreeSet;

use crate::devices::DeviceAllocator;
use crate::network::{NetworkIndex, PortOutcome};

#[derive(Debug, Clone, Copy)]
struct CpuPool {
    free_shares: i64,
}

#[derive(Debug)]
pub struct NodeAccounting {
    cpu: CpuPool,
    free_cores: std::collections::BTreeMap<u32, BTreeSet<u32>>,
    free_memory_mb: i64,
    free_disk_mb: i64,
    max_allocs: u32,
    used_allocs: u32,
    network: NetworkIndex,
    devices: DeviceAllocator,
}

pub struct Commit {
    pub device_instance_ids: std::collections::BTreeMap<scheduler_types::DeviceClassId, Vec<String>>,
    pub core_ids: std::collections::BTreeMap<String, BTreeSet<u32>>,
    pub port_assignments: Vec<(String, String, u16)>, // (task, label, port) informational
}

impl NodeAccounting {
    /// Initializes from `node` totals minus reserved, minus the resources of
    /// `existing` allocations (already filtered by the caller to exclude
    /// ones the current plan stops/evicts/preempts), minus resources the
    /// plan has already placed on this node this pass (§4.1 steps 1-2).
    pub fn build<'a>(
        node: &Node,
        existing: impl IntoIterator<Item = &'a Allocation>,
        already_placed: impl IntoIterator<Item = &'a Allocation>,
    ) -> Result<Self, DimensionExhausted> {
        let total = &node.total_resources;
        let reserved = &node.reserved_resources;

        let mut free_shares = total.cpu_shares as i64 - reserved.cpu_shares as i64;
        let mut free_memory_mb = total.memory_mb as i64 - reserved.memory_mb as i64;
        let mut free_disk_mb = total.disk_mb as i64 - reserved.disk_mb as i64;

        let mut free_cores = total.cores_by_numa_node.clone();
        for (numa, cores) in &reserved.cores_by_numa_node {
            if let Some(set) = free_cores.get_mut(numa) {
                for c in cores {
                    set.remove(c);
                }
            }
        }

        let mut used_allocs = 0u32;
        let mut reservations: Vec<(Option<String>, Vec<u16>)> = Vec::new();
        let mut used_devices: std::collections::BTreeMap<scheduler_types::DeviceClassId, Vec<String>> =
            std::collections::BTreeMap::new();
        let mut used_core_ids: BTreeSet<u32> = BTreeSet::new();

        let all_committed = existing.into_iter().chain(already_placed);
        for alloc in all_committed {
            used_allocs += 1;
            free_disk_mb -= alloc.resources.shared_disk_mb as i64;
            for (task_name, task) in &alloc.resources.tasks {
                match &task.cpu {
                    CpuRequest::Shares(s) => free_shares -= *s as i64,
                    CpuRequest::Cores { .. } => {
                        if let Some(ids) = alloc.resources.core_ids.get(task_name) {
                            used_core_ids.extend(ids.iter().copied());
                        }
                    }
                }
                free_memory_mb -= task.memory.memory_mb as i64;
                for net in &task.networks {
                    for port in &net.ports {
                        if let Some(value) = port.value {
                            reservations.push((port.host_network.clone(), vec![value]));
                        }
                    }
                }
            }
            for (class, ids) in &alloc.resources.device_instance_ids {
                used_devices.entry(class.clone()).or_default().extend(ids.iter().cloned());
            }
        }
        for (numa, cores) in free_cores.iter_mut() {
            let _ = numa;
            cores.retain(|c| !used_core_ids.contains(c));
        }

        let network = NetworkIndex::build(&total.host_networks, reservations).map_err(|_| DimensionExhausted::NetworkInvalidNode)?;
        let devices = DeviceAllocator::build(&total.devices, used_devices);

        Ok(NodeAccounting {
            cpu: CpuPool { free_shares },
            free_cores,
            free_memory_mb,
            free_disk_mb,
            max_allocs: node.max_allocs,
            used_allocs,
            network,
            devices,
        })
    }

    pub fn free_cpu_shares(&self) -> i64 {
        self.cpu.free_shares
    }

    pub fn free_memory_mb(&self) -> i64 {
        self.free_memory_mb
    }

    pub fn free_disk_mb(&self) -> i64 {
        self.free_disk_mb
    }

    /// Returns the first exhaustion dimension, if any (§4.1 `fits`).
    pub fn fits(&self, tasks: &[(String, TaskResources)], shared_disk_mb: u64) -> Result<(), DimensionExhausted> {
        if self.max_allocs > 0 && self.used_allocs >= self.max_allocs {
            return Err(DimensionExhausted::MaxAllocations);
        }
        if self.free_disk_mb < shared_disk_mb as i64 {
            return Err(DimensionExhausted::Disk);
        }

        let mut shares_needed: i64 = 0;
        let mut cores_needed_by_numa: std::collections::BTreeMap<u32, u32> = std::collections::BTreeMap::new();
        let mut memory_needed: i64 = 0;

        for (_, t) in tasks {
            memory_needed += t.memory.memory_mb as i64;
            match &t.cpu {
                CpuRequest::Shares(s) => shares_needed += *s as i64,
                CpuRequest::Cores { count, numa } => {
                    if !self.cores_available(*count, *numa) {
                        return Err(DimensionExhausted::Cpu);
                    }
                    *cores_needed_by_numa.entry(0).or_default() += count;
                }
            }
            for req in &t.devices {
                if !self.devices.has_match(req) {
                    return Err(DimensionExhausted::DevicesNoMatch);
                }
            }
        }

        if self.cpu.free_shares < shares_needed {
            return Err(DimensionExhausted::Cpu);
        }
        if self.free_memory_mb < memory_needed {
            return Err(DimensionExhausted::Memory);
        }

        for (_, t) in tasks {
            for net in &t.networks {
                for port in &net.ports {
                    if let Some(value) = port.value {
                        let address = port
                            .host_network
                            .clone()
                            .unwrap_or_else(|| "default".to_string());
                        if self.network.has_collision(&address, value) {
                            return Err(DimensionExhausted::NetworkPortCollision);
                        }
                    }
                }
                match self.network.try_reserve(net) {
                    PortOutcome::Collision => return Err(DimensionExhausted::NetworkPortCollision),
                    PortOutcome::Assigned { .. } => {}
                }
            }
        }

        Ok(())
    }

    fn cores_available(&self, count: u32, affinity: NumaAffinity) -> bool {
        let total_free: usize = self.free_cores.values().map(|s| s.len()).sum();
        match affinity {
            NumaAffinity::Require => self.free_cores.values().any(|s| s.len() as u32 >= count),
            NumaAffinity::Prefer | NumaAffinity::None => total_free as u32 >= count,
        }
    }

    /// Bin-pack score in `[0, 1]`: utilization after hypothetical placement,
    /// averaged across CPU and memory, then taken under a square root so
    /// that scores fall off faster than linearly as a node empties out
    /// (§4.1 `score`, §8 "Bin-pack tiebreak": a node with free=3072 asked
    /// for 1024 scores in `[0.50, 0.60]`, not the `~0.33` a plain linear
    /// `want/free` ratio would give).
    pub fn score(&self, tasks: &[(String, TaskResources)]) -> f64 {
        let total_shares = self.cpu.free_shares.max(0) as f64;
        let total_memory = self.free_memory_mb.max(0) as f64;

        let want_shares: f64 = tasks
            .iter()
            .map(|(_, t)| match t.cpu {
                CpuRequest::Shares(s) => s as f64,
                CpuRequest::Cores { .. } => 0.0,
            })
            .sum();
        let want_memory: f64 = tasks.iter().map(|(_, t)| t.memory.memory_mb as f64).sum();

        let cpu_util = if total_shares > 0.0 { (want_shares / total_shares).min(1.0) } else { 1.0 };
        let mem_util = if total_memory > 0.0 { (want_memory / total_memory).min(1.0) } else { 1.0 };

        (((cpu_util + mem_util) / 2.0).clamp(0.0, 1.0)).sqrt()
    }

    /// Subtracts resources and records chosen device instance ids (§4.1
    /// `commit`). Caller is expected to have already checked `fits`.
    pub fn commit(&mut self, tasks: &[(String, TaskResources)], shared_disk_mb: u64) -> Commit {
        self.used_allocs += 1;
        self.free_disk_mb -= shared_disk_mb as i64;

        let mut device_instance_ids = std::collections::BTreeMap::new();
        let mut core_ids = std::collections::BTreeMap::new();
        let mut port_assignments = Vec::new();

        for (task_name, t) in tasks {
            match &t.cpu {
                CpuRequest::Shares(s) => self.cpu.free_shares -= *s as i64,
                CpuRequest::Cores { count, numa } => {
                    if let Some(ids) = self.take_cores(*count, *numa) {
                        core_ids.insert(task_name.clone(), ids);
                    }
                }
            }
            self.free_memory_mb -= t.memory.memory_mb as i64;

            for req in &t.devices {
                if let Some(ids) = self.devices.commit(req) {
                    device_instance_ids.insert(req.id(), ids);
                }
            }

            for net in &t.networks {
                for port in &net.ports {
                    let address = port.host_network.clone().unwrap_or_else(|| "default".to_string());
                    let value = port.value.unwrap_or(0);
                    self.network.commit(&address, value);
                    port_assignments.push((task_name.clone(), port.label.clone(), value));
                }
            }
        }

        Commit {
            device_instance_ids,
            core_ids,
            port_assignments,
        }
    }

    fn take_cores(&mut self, count: u32, affinity: NumaAffinity) -> Option<BTreeSet<u32>> {
        if matches!(affinity, NumaAffinity::Require) {
            let numa = self
                .free_cores
                .iter()
                .find(|(_, s)| s.len() as u32 >= count)
                .map(|(n, _)| *n)?;
            let set = self.free_cores.get_mut(&numa)?;
            let chosen: BTreeSet<u32> = set.iter().take(count as usize).copied().collect();
            for c in &chosen {
                set.remove(c);
            }
            return Some(chosen);
        }

        let mut remaining = count;
        let mut chosen = BTreeSet::new();
        let numa_nodes: Vec<u32> = self.free_cores.keys().copied().collect();
        for numa in numa_nodes {
            if remaining == 0 {
                break;
            }
            let set = self.free_cores.get_mut(&numa).unwrap();
            let take: Vec<u32> = set.iter().take(remaining as usize).copied().collect();
            for c in &take {
                set.remove(c);
            }
            remaining -= take.len() as u32;
            chosen.extend(take);
        }
        if remaining > 0 {
            None
        } else {
            Some(chosen)
        }
    }

    pub fn helper_tasks(resources: &AllocatedResources) -> Vec<(String, TaskResources)> {
        resources.tasks.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_types::{CpuRequest, MemoryRequest, NodeResources, NodeStatus, PluginFingerprints};
    use std::collections::BTreeMap;

    fn node(cpu_shares: u32, memory_mb: u64) -> Node {
        Node {
            id: uuid::Uuid::new_v4(),
            datacenter: "dc1".into(),
            node_pool: "default".into(),
            node_class: "class-a".into(),
            status: NodeStatus::Ready,
            scheduling_eligible: true,
            attributes: BTreeMap::new(),
            metadata: BTreeMap::new(),
            total_resources: NodeResources {
                cpu_shares,
                cores_by_numa_node: BTreeMap::new(),
                memory_mb,
                disk_mb: 10_000,
                host_networks: vec![],
                devices: vec![],
            },
            reserved_resources: NodeResources {
                cpu_shares: 0,
                cores_by_numa_node: BTreeMap::new(),
                memory_mb: 0,
                disk_mb: 0,
                host_networks: vec![],
                devices: vec![],
            },
            plugins: PluginFingerprints::default(),
            drivers: BTreeMap::new(),
            max_allocs: 0,
        }
    }

    fn task(cpu_shares: u32, memory_mb: u64) -> TaskResources {
        TaskResources {
            cpu: CpuRequest::Shares(cpu_shares),
            memory: MemoryRequest {
                memory_mb,
                memory_max_mb: None,
            },
            disk_mb: 0,
            devices: vec![],
            networks: vec![],
        }
    }

    #[test]
    fn perfect_fit_scores_one() {
        let n = node(2048, 2048);
        let acc = NodeAccounting::build(&n, std::iter::empty(), std::iter::empty()).unwrap();
        let tasks = vec![("web".to_string(), task(2048, 2048))];
        assert!(acc.fits(&tasks, 0).is_ok());
        assert_eq!(acc.score(&tasks), 1.0);
    }

    #[test]
    fn bin_pack_tiebreak_scores_fuller_node_lower() {
        let n1 = node(1024, 1024);
        let n3 = node(3072, 3072);
        let tasks = vec![("web".to_string(), task(1024, 1024))];

        let acc1 = NodeAccounting::build(&n1, std::iter::empty(), std::iter::empty()).unwrap();
        assert!(acc1.fits(&tasks, 0).is_ok());
        assert_eq!(acc1.score(&tasks), 1.0);

        let acc3 = NodeAccounting::build(&n3, std::iter::empty(), std::iter::empty()).unwrap();
        assert!(acc3.fits(&tasks, 0).is_ok());
        let score3 = acc3.score(&tasks);
        assert!((0.50..=0.60).contains(&score3), "expected score3 in [0.50, 0.60], got {score3}");
    }

    #[test]
    fn exhausted_memory_reports_dimension() {
        let n = node(2048, 512);
        let acc = NodeAccounting::build(&n, std::iter::empty(), std::iter::empty()).unwrap();
        let tasks = vec![("web".to_string(), task(100, 1024))];
        assert_eq!(acc.fits(&tasks, 0), Err(DimensionExhausted::Memory));
    }
}
