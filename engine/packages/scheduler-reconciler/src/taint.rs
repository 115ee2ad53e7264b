//! Taint classification (§4.5.1): partitions an allocation set into seven
//! disjoint buckets given current node/cluster state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use scheduler_types::{Allocation, ClientStatus, DesiredStatus, DisconnectStrategy, NodeStatus};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaintBucket {
    Untainted,
    Migrate,
    Lost,
    Disconnecting,
    Reconnecting,
    Ignore,
    Expiring,
}

/// Node status as seen by the reconciler, plus the disconnect-support
/// context needed for bucket membership. A node absent from `nodes` is
/// treated as gone (`Down`) — see `node_status`.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub nodes: BTreeMap<Uuid, NodeStatus>,
    pub now: DateTime<Utc>,
}

impl ClusterState {
    pub fn node_status(&self, node_id: Uuid) -> NodeStatus {
        self.nodes.get(&node_id).copied().unwrap_or(NodeStatus::Down)
    }
}

/// Classifies a single allocation (§4.5.1's table). `disconnect` is the
/// owning task group's disconnect strategy, if the job opts in.
pub fn classify_alloc(alloc: &Allocation, disconnect: Option<&DisconnectStrategy>, cluster: &ClusterState) -> TaintBucket {
    // Taint tracks node health, not allocation failure: a `Failed` alloc on
    // a healthy node is not "terminal" for bucketing purposes — it falls
    // through to `Untainted` here and is handed to reschedule classification
    // (§4.5.2) separately, by the desired-change pass.
    let bucket_terminal = matches!(alloc.desired_status, DesiredStatus::Stop | DesiredStatus::Evict)
        || alloc.client_status == ClientStatus::Complete;
    if bucket_terminal {
        return if alloc.client_status == ClientStatus::Complete {
            TaintBucket::Untainted
        } else {
            TaintBucket::Ignore
        };
    }

    let node_status = cluster.node_status(alloc.node_id);
    let node_known = cluster.nodes.contains_key(&alloc.node_id);

    // §9 Open Question: pending allocations on a disconnected node are
    // always lost, independent of job disconnect support.
    if alloc.client_status == ClientStatus::Pending && node_status == NodeStatus::Disconnected {
        return TaintBucket::Lost;
    }

    if alloc.desired_transition.migrate && (node_status == NodeStatus::Draining || !node_known) {
        return TaintBucket::Migrate;
    }

    if node_status == NodeStatus::Down || !node_known {
        return TaintBucket::Lost;
    }

    // Reconnecting: alloc's most recent transition is to Running after
    // having passed through Unknown, and the alloc is still running, or
    // failed while desired=run (so the server can stop it).
    if let Some(last) = alloc.last_alloc_state() {
        if last.status == ClientStatus::Running {
            let came_from_unknown = alloc
                .alloc_states
                .iter()
                .rev()
                .skip(1)
                .any(|t| t.status == ClientStatus::Unknown);
            let eligible = alloc.client_status == ClientStatus::Running
                || (alloc.client_status == ClientStatus::Failed && alloc.desired_status == DesiredStatus::Run);
            if came_from_unknown && eligible {
                return TaintBucket::Reconnecting;
            }
        }
    }

    if node_status == NodeStatus::Disconnected {
        if alloc.client_status == ClientStatus::Unknown {
            if let (Some(strategy), Some(last)) = (disconnect, alloc.last_alloc_state()) {
                let unknown_for = (cluster.now - last.time).to_std().unwrap_or_default();
                if unknown_for > strategy.lost_after {
                    return TaintBucket::Expiring;
                }
            }
        } else if alloc.client_status == ClientStatus::Running && disconnect.is_some() {
            return TaintBucket::Disconnecting;
        }
    }

    TaintBucket::Untainted
}

/// Buckets every allocation in `allocs`, preserving input order within each
/// bucket (determinism, §8 invariant 9).
pub fn classify_all<'a>(
    allocs: &'a [Allocation],
    disconnect: Option<&DisconnectStrategy>,
    cluster: &ClusterState,
) -> BTreeMap<TaintBucket, Vec<&'a Allocation>> {
    let mut buckets: BTreeMap<TaintBucket, Vec<&Allocation>> = BTreeMap::new();
    for alloc in allocs {
        buckets.entry(classify_alloc(alloc, disconnect, cluster)).or_default().push(alloc);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_types::{AllocStateTransition, AllocatedResources, DesiredTransition, JobVersion, RescheduleTracker};

    fn base_alloc(node_id: Uuid) -> Allocation {
        Allocation {
            id: Uuid::new_v4(),
            namespace: "default".into(),
            job_id: "web".into(),
            job_version: JobVersion(0),
            node_id,
            task_group: "app".into(),
            index: 0,
            name: "web.app[0]".into(),
            resources: AllocatedResources {
                tasks: Default::default(),
                shared_disk_mb: 0,
                device_instance_ids: Default::default(),
                core_ids: Default::default(),
            },
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
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
    fn healthy_running_alloc_is_untainted() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Ready);
        assert_eq!(classify_alloc(&base_alloc(node_id), None, &cluster), TaintBucket::Untainted);
    }

    #[test]
    fn pending_on_disconnected_node_is_always_lost() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Disconnected);
        let mut alloc = base_alloc(node_id);
        alloc.client_status = ClientStatus::Pending;
        let strategy = DisconnectStrategy { replace: true, ..Default::default() };
        assert_eq!(classify_alloc(&alloc, Some(&strategy), &cluster), TaintBucket::Lost);
    }

    #[test]
    fn running_on_down_node_is_lost() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Down);
        assert_eq!(classify_alloc(&base_alloc(node_id), None, &cluster), TaintBucket::Lost);
    }

    #[test]
    fn draining_node_with_migrate_transition_buckets_migrate() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Draining);
        let mut alloc = base_alloc(node_id);
        alloc.desired_transition.migrate = true;
        assert_eq!(classify_alloc(&alloc, None, &cluster), TaintBucket::Migrate);
    }

    #[test]
    fn running_on_disconnected_node_with_disconnect_support_is_disconnecting() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Disconnected);
        let strategy = DisconnectStrategy { replace: true, ..Default::default() };
        assert_eq!(classify_alloc(&base_alloc(node_id), Some(&strategy), &cluster), TaintBucket::Disconnecting);
    }

    #[test]
    fn reconnected_after_unknown_is_reconnecting() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Ready);
        cluster.now = Utc::now();
        let mut alloc = base_alloc(node_id);
        alloc.alloc_states = vec![
            AllocStateTransition { time: cluster.now - chrono::Duration::seconds(10), status: ClientStatus::Unknown },
            AllocStateTransition { time: cluster.now, status: ClientStatus::Running },
        ];
        assert_eq!(classify_alloc(&alloc, None, &cluster), TaintBucket::Reconnecting);
    }

    #[test]
    fn stopped_terminal_alloc_is_ignored() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Ready);
        let mut alloc = base_alloc(node_id);
        alloc.desired_status = DesiredStatus::Stop;
        assert_eq!(classify_alloc(&alloc, None, &cluster), TaintBucket::Ignore);
    }

    #[test]
    fn unknown_past_lost_after_is_expiring() {
        let node_id = Uuid::new_v4();
        let mut cluster = ClusterState::default();
        cluster.nodes.insert(node_id, NodeStatus::Disconnected);
        cluster.now = Utc::now();
        let strategy = DisconnectStrategy {
            lost_after: std::time::Duration::from_secs(5),
            replace: true,
            ..Default::default()
        };
        let mut alloc = base_alloc(node_id);
        alloc.client_status = ClientStatus::Unknown;
        alloc.alloc_states = vec![AllocStateTransition {
            time: cluster.now - chrono::Duration::seconds(30),
            status: ClientStatus::Unknown,
        }];
        assert_eq!(classify_alloc(&alloc, Some(&strategy), &cluster), TaintBucket::Expiring);
    }
}
