//! End-to-end driver tests against in-memory collaborator fakes, matching
//! the teacher's `tests/integration.rs` convention for the async paths that
//! unit tests inside `src/` can't reach on their own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scheduler_core::{
    CancellationToken, CsiVolumeInfo, IdentitySigner, Planner, PlannerSubmission, ProcessOutcome, RescheduleClock,
    Scheduler, SchedulerConfig, SchedulerError, Snapshot, SnapshotSource,
};
use scheduler_types::{
    Allocation, AllocatedResources, ClientStatus, DesiredStatus, DesiredTransition, Evaluation, Job, JobType, JobVersion,
    MemoryRequest, Node, NodeDeviceGroup, NodeResources, NodeStatus, PluginFingerprints, ReschedulePolicy,
    RescheduleTracker, Task, TaskGroup, TaskResources, TriggerReason,
};
use uuid::Uuid;

fn node(status: NodeStatus) -> Arc<Node> {
    let mut drivers = BTreeMap::new();
    drivers.insert("exec".to_string(), true);
    Arc::new(Node {
        id: Uuid::new_v4(),
        datacenter: "dc1".into(),
        node_pool: "default".into(),
        node_class: "c".into(),
        status,
        scheduling_eligible: true,
        attributes: BTreeMap::new(),
        metadata: BTreeMap::new(),
        total_resources: NodeResources {
            cpu_shares: 4096,
            cores_by_numa_node: BTreeMap::new(),
            memory_mb: 8192,
            disk_mb: 50_000,
            host_networks: vec![],
            devices: Vec::<NodeDeviceGroup>::new(),
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
        drivers,
        max_allocs: 0,
    })
}

fn service_job() -> Arc<Job> {
    Arc::new(Job {
        namespace: "default".into(),
        id: "web".into(),
        version: JobVersion(0),
        job_type: JobType::Service,
        priority: 50,
        create_index: 1,
        datacenters: vec!["dc1".into()],
        constraints: vec![],
        affinities: vec![],
        task_groups: vec![TaskGroup {
            name: "web".into(),
            count: 1,
            constraints: vec![],
            affinities: vec![],
            update: None,
            disconnect: None,
            reschedule: ReschedulePolicy::default(),
            ephemeral_disk_mb: 0,
            host_volumes: vec![],
            csi_volumes: vec![],
            networks: vec![],
            tasks: vec![Task {
                name: "web".into(),
                driver: "exec".into(),
                resources: TaskResources {
                    cpu: scheduler_types::CpuRequest::Shares(512),
                    memory: MemoryRequest { memory_mb: 512, memory_max_mb: None },
                    disk_mb: 0,
                    devices: vec![],
                    networks: vec![],
                },
            }],
            destructive_hash: 0,
            inplace_hash: 0,
        }],
        stop: false,
    })
}

fn running_alloc(job: &Job, node_id: Uuid) -> Allocation {
    Allocation {
        id: Uuid::new_v4(),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        job_version: job.version,
        node_id,
        task_group: "web".into(),
        index: 0,
        name: Allocation::indexed_name(&job.id, "web", 0),
        resources: AllocatedResources {
            tasks: BTreeMap::new(),
            shared_disk_mb: 0,
            device_instance_ids: BTreeMap::new(),
            core_ids: BTreeMap::new(),
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
        alloc_states: Vec::new(),
        create_index: 1,
        modify_index: 1,
    }
}

struct FakeSnapshot {
    nodes: Vec<Arc<Node>>,
    allocs: Vec<Allocation>,
    job: Option<Arc<Job>>,
}

#[async_trait]
impl Snapshot for FakeSnapshot {
    async fn nodes(&self) -> Result<Vec<Arc<Node>>, SchedulerError> {
        Ok(self.nodes.clone())
    }

    async fn node_by_id(&self, id: Uuid) -> Result<Option<Arc<Node>>, SchedulerError> {
        Ok(self.nodes.iter().find(|n| n.id == id).cloned())
    }

    async fn allocs_by_job(&self, _namespace: &str, job_id: &str, include_terminal: bool) -> Result<Vec<Allocation>, SchedulerError> {
        Ok(self
            .allocs
            .iter()
            .filter(|a| a.job_id == job_id && (include_terminal || !a.is_terminal()))
            .cloned()
            .collect())
    }

    async fn allocs_by_node(&self, node_id: Uuid) -> Result<Vec<Allocation>, SchedulerError> {
        Ok(self.allocs.iter().filter(|a| a.node_id == node_id).cloned().collect())
    }

    async fn allocs(&self) -> Result<Vec<Allocation>, SchedulerError> {
        Ok(self.allocs.clone())
    }

    async fn job_by_id(&self, _namespace: &str, _job_id: &str) -> Result<Option<Arc<Job>>, SchedulerError> {
        Ok(self.job.clone())
    }

    async fn csi_volumes_by_id(&self, _namespace: &str, _volume_id: &str) -> Result<Option<CsiVolumeInfo>, SchedulerError> {
        Ok(None)
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn index(&self, _table: &str) -> u64 {
        1
    }
}

struct FakeSnapshotSource(Arc<FakeSnapshot>);

#[async_trait]
impl SnapshotSource for FakeSnapshotSource {
    async fn snapshot(&self) -> Result<Arc<dyn Snapshot>, SchedulerError> {
        Ok(self.0.clone() as Arc<dyn Snapshot>)
    }
}

struct FakePlanner {
    submitted: Mutex<Vec<scheduler_types::Plan>>,
}

#[async_trait]
impl Planner for FakePlanner {
    async fn submit(&self, plan: scheduler_types::Plan) -> Result<PlannerSubmission, SchedulerError> {
        self.submitted.lock().unwrap().push(plan.clone());
        Ok(PlannerSubmission { accepted: plan, raft_index: 1 })
    }
}

struct FakeIdentitySigner;

impl IdentitySigner for FakeIdentitySigner {
    fn sign(&self, claims: &str) -> Result<String, SchedulerError> {
        Ok(format!("signed:{claims}"))
    }
}

struct FakeClock;

impl RescheduleClock for FakeClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

fn build_scheduler(snapshot: FakeSnapshot) -> (Scheduler, Arc<FakePlanner>) {
    let planner = Arc::new(FakePlanner { submitted: Mutex::new(Vec::new()) });
    let scheduler = Scheduler::new(
        Arc::new(FakeSnapshotSource(Arc::new(snapshot))),
        planner.clone(),
        Arc::new(FakeIdentitySigner),
        Arc::new(FakeClock),
    );
    (scheduler, planner)
}

#[tokio::test]
async fn register_places_allocation_on_fitting_node() {
    let job = service_job();
    let n = node(NodeStatus::Ready);
    let (scheduler, planner) = build_scheduler(FakeSnapshot { nodes: vec![n.clone()], allocs: vec![], job: Some(job.clone()) });

    let eval = Evaluation::new("default", "web", 50, TriggerReason::JobRegister);
    let cancel = CancellationToken::new();
    let result = scheduler.process(eval, &cancel).await.expect("process should succeed");

    assert_eq!(result.outcome, ProcessOutcome::Complete);
    let plan = result.plan.expect("a plan should have been submitted");
    let placed = plan.node_allocation.get(&n.id).expect("node should have received a placement");
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].task_group, "web");

    assert_eq!(planner.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn draining_node_blocks_and_emits_follow_up() {
    let job = service_job();
    let n = node(NodeStatus::Draining);
    let (scheduler, planner) = build_scheduler(FakeSnapshot { nodes: vec![n], allocs: vec![], job: Some(job) });

    let eval = Evaluation::new("default", "web", 50, TriggerReason::JobRegister);
    let cancel = CancellationToken::new();
    let result = scheduler.process(eval, &cancel).await.expect("process should succeed");

    assert_eq!(result.outcome, ProcessOutcome::Blocked);
    assert!(result.plan.is_none());
    assert_eq!(result.follow_up_evals.len(), 1);
    assert_eq!(result.follow_up_evals[0].trigger, TriggerReason::QueuedAllocsBlocked);
    assert!(result.eval.blocked_eval.is_some());

    assert!(planner.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn deregistered_job_stops_running_allocations() {
    let job = service_job();
    let n = node(NodeStatus::Ready);
    let alloc = running_alloc(&job, n.id);
    let (scheduler, planner) = build_scheduler(FakeSnapshot { nodes: vec![n.clone()], allocs: vec![alloc.clone()], job: None });

    let eval = Evaluation::new("default", "web", 50, TriggerReason::JobDeregister);
    let cancel = CancellationToken::new();
    let result = scheduler.process(eval, &cancel).await.expect("process should succeed");

    assert_eq!(result.outcome, ProcessOutcome::Complete);
    let plan = result.plan.expect("a stop plan should have been submitted");
    let updates = plan.node_update.get(&n.id).expect("node should have a stop update");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].allocation.id, alloc.id);
    assert_eq!(updates[0].allocation.desired_status, DesiredStatus::Stop);

    assert_eq!(planner.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cancellation_abandons_before_submitting_a_plan() {
    let job = service_job();
    let n = node(NodeStatus::Ready);
    let (scheduler, planner) = build_scheduler(FakeSnapshot { nodes: vec![n], allocs: vec![], job: Some(job) });

    let eval = Evaluation::new("default", "web", 50, TriggerReason::JobRegister);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = scheduler.process(eval, &cancel).await.expect("process should succeed");

    assert_eq!(result.outcome, ProcessOutcome::Cancelled);
    assert!(result.plan.is_none());
    assert!(result.follow_up_evals.is_empty());
    assert!(planner.submitted.lock().unwrap().is_empty());
}
