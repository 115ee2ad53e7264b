//! Desired-change computation (§4.5.3): the core reconcile pass that turns
//! a task group's existing allocations plus taint/reschedule classification
//! into place/stop/update/migrate/canary actions.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use scheduler_types::{Allocation, TaskGroup};
use uuid::Uuid;

use crate::name_index::AllocNameIndex;
use crate::reschedule::{classify_reschedule, RescheduleDecision};
use crate::taint::{classify_all, ClusterState, TaintBucket};

/// Whether the task group's content differs from the version the existing
/// allocations were placed against. Decided by the caller (which has access
/// to both job versions) by comparing `destructive_hash`/`inplace_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGroupChange {
    Unchanged,
    InPlace,
    Destructive,
}

/// Compares the current task group's content hashes against the hashes
/// recorded on its non-canary allocations at placement time (§4.5.3). All
/// live allocations in a group move together, so the first one found is
/// representative; a group with no live allocations needs no update.
pub fn detect_task_group_change(tg: &TaskGroup, existing: &[Allocation]) -> TaskGroupChange {
    let Some(reference) = existing.iter().find(|a| !a.is_canary && a.is_running_like()) else {
        return TaskGroupChange::Unchanged;
    };
    if reference.destructive_hash != tg.destructive_hash {
        TaskGroupChange::Destructive
    } else if reference.inplace_hash != tg.inplace_hash {
        TaskGroupChange::InPlace
    } else {
        TaskGroupChange::Unchanged
    }
}

#[derive(Debug, Clone)]
pub struct PlaceAction {
    pub index: u32,
    pub previous_allocation: Option<Uuid>,
    pub is_canary: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StopAction {
    pub alloc_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct MigrateAction {
    pub alloc_id: Uuid,
    pub replacement: PlaceAction,
}

#[derive(Debug, Clone, Copy)]
pub struct InPlaceUpdateAction {
    pub alloc_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct DestructiveUpdateAction {
    pub old_alloc_id: Uuid,
    pub replacement: PlaceAction,
}

#[derive(Debug, Clone, Copy)]
pub struct FollowUpRequest {
    pub wait_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGroupDesiredChange {
    pub place: Vec<PlaceAction>,
    pub destructive_update: Vec<DestructiveUpdateAction>,
    pub in_place_update: Vec<InPlaceUpdateAction>,
    pub stop: Vec<StopAction>,
    pub migrate: Vec<MigrateAction>,
    pub canary: Vec<PlaceAction>,
    pub reschedule_later: Vec<(Uuid, DateTime<Utc>)>,
    pub follow_up: Option<FollowUpRequest>,
}

impl TaskGroupDesiredChange {
    pub fn place_count(&self) -> u32 {
        (self.place.len() + self.destructive_update.len() + self.migrate.len() + self.canary.len()) as u32
    }
}

/// Reconciles one task group (§4.5.3-§4.5.4). `reschedule_eligible` restricts
/// which allocation ids reschedule classification considers this pass (the
/// caller narrows this to allocs whose `client_status == Failed`).
pub fn reconcile_task_group(
    tg: &TaskGroup,
    existing: &[Allocation],
    cluster: &ClusterState,
    change: TaskGroupChange,
    now: DateTime<Utc>,
    healthy_deadline: Option<std::time::Duration>,
) -> TaskGroupDesiredChange {
    let mut result = TaskGroupDesiredChange::default();
    let buckets = classify_all(existing, tg.disconnect.as_ref(), cluster);

    let empty: Vec<&Allocation> = Vec::new();
    let untainted = buckets.get(&TaintBucket::Untainted).unwrap_or(&empty);
    let reconnecting = buckets.get(&TaintBucket::Reconnecting).unwrap_or(&empty);
    let lost = buckets.get(&TaintBucket::Lost).unwrap_or(&empty);
    let migrate_bucket = buckets.get(&TaintBucket::Migrate).unwrap_or(&empty);
    let disconnecting = buckets.get(&TaintBucket::Disconnecting).unwrap_or(&empty);
    let expiring = buckets.get(&TaintBucket::Expiring).unwrap_or(&empty);

    // Reconnecting allocs whose replacement already landed are retired:
    // mark the original desired=stop so the server retires it.
    for a in reconnecting {
        result.stop.push(StopAction { alloc_id: a.id });
    }

    let replace_disconnecting = tg.disconnect.as_ref().map(|d| d.replace).unwrap_or(true);

    let mut name_index = AllocNameIndex::build(existing.iter().map(|a| (a.index, &a.id)));

    // Reschedule classification for failed-but-otherwise-untainted allocs
    // (§4.5.2); batch jobs that completed successfully never reach here
    // since `Complete` allocs bucket as `Untainted` without being failed.
    let mut failed_needing_replacement: Vec<&Allocation> = Vec::new();
    let mut live_untainted: Vec<&Allocation> = Vec::new();
    for a in untainted {
        if a.client_status == scheduler_types::ClientStatus::Failed {
            match classify_reschedule(a, &tg.reschedule, now, healthy_deadline) {
                RescheduleDecision::Now { .. } => failed_needing_replacement.push(a),
                RescheduleDecision::Later { next_reschedule_at } => {
                    result.reschedule_later.push((a.id, next_reschedule_at));
                }
                RescheduleDecision::Denied => {}
            }
        } else if a.client_status == scheduler_types::ClientStatus::Complete {
            // terminal success, occupies no slot, needs no action.
        } else {
            live_untainted.push(a);
        }
    }

    let mut needing_replacement: Vec<&Allocation> = Vec::new();
    needing_replacement.extend(lost.iter().copied());
    needing_replacement.extend(expiring.iter().copied());
    needing_replacement.extend(failed_needing_replacement);
    if replace_disconnecting {
        needing_replacement.extend(disconnecting.iter().copied());
    }

    for a in &needing_replacement {
        name_index.release(a.index);
        let idx = name_index.next_indices(1)[0];
        result.place.push(PlaceAction { index: idx, previous_allocation: Some(a.id), is_canary: false });
    }

    let max_parallel = tg.max_parallel();
    let migrate_cap = if max_parallel > 0 { max_parallel as usize } else { migrate_bucket.len() };
    for a in migrate_bucket.iter().take(migrate_cap) {
        name_index.release(a.index);
        let idx = name_index.next_indices(1)[0];
        result.migrate.push(MigrateAction {
            alloc_id: a.id,
            replacement: PlaceAction { index: idx, previous_allocation: Some(a.id), is_canary: false },
        });
    }

    let has_canaries = existing.iter().any(|a| a.is_canary);
    let canary_count = tg.canary_count();

    match change {
        TaskGroupChange::Unchanged => {}
        TaskGroupChange::InPlace => {
            for a in &live_untainted {
                result.in_place_update.push(InPlaceUpdateAction { alloc_id: a.id });
            }
        }
        TaskGroupChange::Destructive => {
            if canary_count > 0 && !has_canaries {
                let indices = name_index.next_indices(canary_count);
                for idx in indices {
                    result.canary.push(PlaceAction { index: idx, previous_allocation: None, is_canary: true });
                }
            } else if !has_canaries {
                let cap = if tg.update.as_ref().map(|u| u.is_rolling()).unwrap_or(false) {
                    max_parallel as usize
                } else {
                    live_untainted.len()
                };
                let staged: Vec<&&Allocation> = live_untainted.iter().take(cap).collect();
                for a in &staged {
                    name_index.release(a.index);
                    let idx = name_index.next_indices(1)[0];
                    result.destructive_update.push(DestructiveUpdateAction {
                        old_alloc_id: a.id,
                        replacement: PlaceAction { index: idx, previous_allocation: Some(a.id), is_canary: false },
                    });
                }
                if staged.len() < live_untainted.len() {
                    if let Some(update) = &tg.update {
                        result.follow_up = Some(FollowUpRequest { wait_until: now + chrono::Duration::from_std(update.stagger).unwrap_or(chrono::Duration::zero()) });
                    }
                }
            }
        }
    }

    let destructively_updated: BTreeSet<Uuid> = result.destructive_update.iter().map(|d| d.old_alloc_id).collect();
    let remaining_live: Vec<&&Allocation> = live_untainted.iter().filter(|a| !destructively_updated.contains(&a.id)).collect();

    let occupied = remaining_live.len()
        + result.place.len()
        + result.migrate.len()
        + result.destructive_update.len()
        + result.canary.len()
        + disconnecting.len().saturating_sub(if replace_disconnecting { disconnecting.len() } else { 0 });

    if (occupied as u32) < tg.count {
        let new_count = tg.count - occupied as u32;
        for idx in name_index.next_indices(new_count) {
            result.place.push(PlaceAction { index: idx, previous_allocation: None, is_canary: false });
        }
    } else if (occupied as u32) > tg.count {
        let excess = occupied as u32 - tg.count;
        let victim_indices: Vec<u32> = remaining_live.iter().map(|a| a.index).collect();
        let mut victims_by_index: std::collections::BTreeMap<u32, Uuid> =
            remaining_live.iter().map(|a| (a.index, a.id)).collect();
        let mut sorted_indices = victim_indices;
        sorted_indices.sort_unstable();
        for idx in sorted_indices.into_iter().rev().take(excess as usize) {
            if let Some(id) = victims_by_index.remove(&idx) {
                result.stop.push(StopAction { alloc_id: id });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_types::{
        AllocatedResources, ClientStatus, DesiredStatus, DesiredTransition, JobVersion, NodeStatus, ReschedulePolicy,
        RescheduleTracker,
    };
    use std::collections::BTreeMap;

    fn tg(count: u32) -> TaskGroup {
        TaskGroup {
            name: "app".into(),
            count,
            constraints: vec![],
            affinities: vec![],
            update: None,
            disconnect: None,
            reschedule: ReschedulePolicy::default(),
            ephemeral_disk_mb: 0,
            host_volumes: vec![],
            csi_volumes: vec![],
            networks: vec![],
            tasks: vec![],
            destructive_hash: 0,
            inplace_hash: 0,
        }
    }

    fn alloc(node_id: Uuid, index: u32, status: ClientStatus) -> Allocation {
        Allocation {
            id: Uuid::new_v4(),
            namespace: "default".into(),
            job_id: "web".into(),
            job_version: JobVersion(0),
            node_id,
            task_group: "app".into(),
            index,
            name: format!("web.app[{index}]"),
            resources: AllocatedResources {
                tasks: Default::default(),
                shared_disk_mb: 0,
                device_instance_ids: Default::default(),
                core_ids: Default::default(),
            },
            desired_status: DesiredStatus::Run,
            client_status: status,
            desired_transition: DesiredTransition::default(),
            previous_allocation: None,
            next_allocation: None,
            is_canary: false,
            destructive_hash: 0,
            inplace_hash: 0,
            reschedule_tracker: RescheduleTracker::default(),
            alloc_states: vec![],
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn scale_up_places_missing_allocations() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Ready);
        let existing = vec![alloc(node_id, 0, ClientStatus::Running)];
        let change = reconcile_task_group(&tg(3), &existing, &cluster, TaskGroupChange::Unchanged, cluster.now, None);
        assert_eq!(change.place.len(), 2);
        assert!(change.stop.is_empty());
    }

    #[test]
    fn scale_down_stops_highest_index() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Ready);
        let existing = vec![
            alloc(node_id, 0, ClientStatus::Running),
            alloc(node_id, 1, ClientStatus::Running),
            alloc(node_id, 2, ClientStatus::Running),
        ];
        let highest_id = existing[2].id;
        let change = reconcile_task_group(&tg(1), &existing, &cluster, TaskGroupChange::Unchanged, cluster.now, None);
        assert_eq!(change.stop.len(), 2);
        assert!(change.stop.iter().any(|s| s.alloc_id == highest_id));
    }

    #[test]
    fn lost_alloc_gets_chained_replacement() {
        let node_id = Uuid::new_v4();
        let cluster = ClusterState { nodes: BTreeMap::new(), now: Utc::now() }; // node unknown -> Down/lost
        let existing = vec![alloc(node_id, 0, ClientStatus::Running)];
        let change = reconcile_task_group(&tg(1), &existing, &cluster, TaskGroupChange::Unchanged, cluster.now, None);
        assert_eq!(change.place.len(), 1);
        assert_eq!(change.place[0].previous_allocation, Some(existing[0].id));
    }

    #[test]
    fn detect_change_compares_against_live_allocation_hashes() {
        let node_id = Uuid::new_v4();
        let mut group = tg(1);
        group.destructive_hash = 7;
        group.inplace_hash = 3;

        let mut matching = alloc(node_id, 0, ClientStatus::Running);
        matching.destructive_hash = 7;
        matching.inplace_hash = 3;
        assert_eq!(detect_task_group_change(&group, &[matching.clone()]), TaskGroupChange::Unchanged);

        let mut inplace_only = matching.clone();
        inplace_only.inplace_hash = 99;
        assert_eq!(detect_task_group_change(&group, &[inplace_only]), TaskGroupChange::InPlace);

        let mut destructive = matching.clone();
        destructive.destructive_hash = 1;
        assert_eq!(detect_task_group_change(&group, &[destructive]), TaskGroupChange::Destructive);

        assert_eq!(detect_task_group_change(&group, &[]), TaskGroupChange::Unchanged);
    }
}
