//! Plan value model — C8 (§4.8). Pure values, no side effects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::allocation::Allocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeUpdateKind {
    Stop,
    Evict,
    InPlace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub kind: NodeUpdateKind,
    pub allocation: Allocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePreemption {
    pub allocation: Allocation,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredTgUpdates {
    pub place: u32,
    pub inplace_update: u32,
    pub destructive_update: u32,
    pub stop: u32,
    pub migrate: u32,
    pub canary: u32,
    pub preemptions: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    pub desired_tg_updates: BTreeMap<String, DesiredTgUpdates>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: Uuid,
    pub priority: i32,
    pub node_allocation: BTreeMap<Uuid, Vec<Allocation>>,
    pub node_update: BTreeMap<Uuid, Vec<NodeUpdate>>,
    pub node_preemptions: BTreeMap<Uuid, Vec<NodePreemption>>,
    pub annotations: Option<Annotations>,
}

impl Plan {
    pub fn new(eval_id: Uuid, priority: i32) -> Self {
        Plan {
            eval_id,
            priority,
            ..Default::default()
        }
    }

    pub fn append_placement(&mut self, node_id: Uuid, alloc: Allocation) {
        self.node_allocation.entry(node_id).or_default().push(alloc);
    }

    pub fn append_update(&mut self, node_id: Uuid, kind: NodeUpdateKind, alloc: Allocation) {
        self.node_update
            .entry(node_id)
            .or_default()
            .push(NodeUpdate { kind, allocation: alloc });
    }

    pub fn append_preemption(&mut self, node_id: Uuid, alloc: Allocation, preemptor_id: Uuid) {
        self.node_preemptions.entry(node_id).or_default().push(NodePreemption {
            allocation: alloc,
            description: format!("Preempted by alloc ID {preemptor_id}"),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.node_allocation.values().all(|v| v.is_empty())
            && self.node_update.values().all(|v| v.is_empty())
            && self.node_preemptions.values().all(|v| v.is_empty())
    }

    /// Invariant 1 (§8): for any node, placements/updates/preemptions are
    /// pairwise disjoint by allocation id.
    pub fn check_disjoint(&self) -> Result<(), String> {
        let nodes: std::collections::BTreeSet<Uuid> = self
            .node_allocation
            .keys()
            .chain(self.node_update.keys())
            .chain(self.node_preemptions.keys())
            .copied()
            .collect();
        for node in nodes {
            let mut seen = std::collections::HashSet::new();
            let placed = self.node_allocation.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
            let updated = self.node_update.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
            let preempted = self.node_preemptions.get(&node).map(|v| v.as_slice()).unwrap_or(&[]);
            for id in placed
                .iter()
                .map(|a| a.id)
                .chain(updated.iter().map(|u| u.allocation.id))
                .chain(preempted.iter().map(|p| p.allocation.id))
            {
                if !seen.insert(id) {
                    return Err(format!("allocation {id} appears more than once on node {node}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{Allocation, AllocStateTransition, ClientStatus, DesiredStatus, DesiredTransition, RescheduleTracker};
    use crate::job::JobVersion;
    use crate::resources::AllocatedResources;

    fn alloc(id: Uuid, node_id: Uuid) -> Allocation {
        Allocation {
            id,
            namespace: "default".into(),
            job_id: "web".into(),
            job_version: JobVersion(0),
            node_id,
            task_group: "web".into(),
            index: 0,
            name: "web.web[0]".into(),
            resources: AllocatedResources {
                tasks: Default::default(),
                shared_disk_mb: 0,
                device_instance_ids: Default::default(),
                core_ids: Default::default(),
            },
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Pending,
            desired_transition: DesiredTransition::default(),
            previous_allocation: None,
            next_allocation: None,
            is_canary: false,
            destructive_hash: 0,
            inplace_hash: 0,
            reschedule_tracker: RescheduleTracker::default(),
            alloc_states: Vec::<AllocStateTransition>::new(),
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn disjoint_plan_passes() {
        let node = Uuid::new_v4();
        let mut plan = Plan::new(Uuid::new_v4(), 50);
        plan.append_placement(node, alloc(Uuid::new_v4(), node));
        plan.append_update(node, NodeUpdateKind::Stop, alloc(Uuid::new_v4(), node));
        assert!(plan.check_disjoint().is_ok());
    }

    #[test]
    fn same_alloc_in_two_buckets_is_rejected() {
        let node = Uuid::new_v4();
        let dup = Uuid::new_v4();
        let mut plan = Plan::new(Uuid::new_v4(), 50);
        plan.append_placement(node, alloc(dup, node));
        plan.append_update(node, NodeUpdateKind::Stop, alloc(dup, node));
        assert!(plan.check_disjoint().is_err());
    }
}
