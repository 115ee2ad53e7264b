//! C6 — scheduler drivers (§4.6): the per-evaluation processing loop shared
//! by the service/batch/system/sysbatch job types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scheduler_feasible::preempt::JobRank;
use scheduler_feasible::ranking::PreemptionConfig;
use scheduler_feasible::{NodeAccounting, SelectOptions, Stack, StackKind};
use scheduler_reconciler::{detect_task_group_change, reconcile_task_group, ClusterState, TaskGroupDesiredChange};
use scheduler_types::{
    Allocation, AllocatedResources, ClientStatus, DesiredStatus, DesiredTgUpdates, DesiredTransition, EvalStatus,
    Evaluation, FailedTaskGroupAllocs, Job, NodeUpdateKind, Plan, RescheduleTracker, TaskGroup, TriggerReason,
};
use uuid::Uuid;

use crate::collaborators::{IdentitySigner, Planner, RescheduleClock, Snapshot, SnapshotSource};
use crate::error::SchedulerError;

/// Per-evaluation cancellation signal (§5): "each evaluation carries a
/// cancellation signal from its worker; on cancellation, the driver abandons
/// the evaluation without submitting a plan." A cheap `Arc<AtomicBool>`
/// rather than a channel, since the driver only ever polls it between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A driver is not polymorphic via dynamic dispatch per job type (§4.6): the
/// loop is identical for all four types, and `Stack::new` already takes the
/// `StackKind` the job type maps to (system/sysbatch -> `System`, else
/// `Generic`).
pub struct Scheduler {
    snapshot_source: Arc<dyn SnapshotSource>,
    planner: Arc<dyn Planner>,
    identity_signer: Arc<dyn IdentitySigner>,
    clock: Arc<dyn RescheduleClock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Complete,
    Blocked,
    /// Cancellation observed mid-evaluation (§5): the plan is abandoned and
    /// no follow-up evaluations are emitted.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub eval: Evaluation,
    pub plan: Option<Plan>,
    pub follow_up_evals: Vec<Evaluation>,
    pub outcome: ProcessOutcome,
}

struct BuiltPlan {
    plan: Plan,
    desired_tg_updates: BTreeMap<String, DesiredTgUpdates>,
    failed_tg_allocs: BTreeMap<String, FailedTaskGroupAllocs>,
    follow_up_evals: Vec<Evaluation>,
    any_blocked: bool,
}

fn stack_kind_for(job: &Job) -> StackKind {
    if job.job_type.is_system_like() {
        StackKind::System
    } else {
        StackKind::Generic
    }
}

fn find_alloc<'a>(allocs: &'a [Allocation], id: Uuid) -> Option<&'a Allocation> {
    allocs.iter().find(|a| a.id == id)
}

/// §5: a cancelled evaluation is abandoned without submitting a plan and
/// without emitting follow-up evaluations.
fn abandoned(mut eval: Evaluation) -> ProcessResult {
    eval.status = EvalStatus::Complete;
    ProcessResult { eval, plan: None, follow_up_evals: Vec::new(), outcome: ProcessOutcome::Cancelled }
}

impl Scheduler {
    pub fn new(
        snapshot_source: Arc<dyn SnapshotSource>,
        planner: Arc<dyn Planner>,
        identity_signer: Arc<dyn IdentitySigner>,
        clock: Arc<dyn RescheduleClock>,
    ) -> Self {
        Scheduler { snapshot_source, planner, identity_signer, clock }
    }

    async fn load_snapshot(&self) -> Result<Arc<dyn Snapshot>, SchedulerError> {
        let deadline = crate::config::SchedulerConfig::default().snapshot_deadline;
        // No snapshot exists yet to source `scheduler_config()` from, so the
        // bootstrap deadline uses the default; once loaded, all other
        // deadlines come from `snapshot.scheduler_config()`.
        match tokio::time::timeout(deadline, self.snapshot_source.snapshot()).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout { operation: "snapshot read" }),
        }
    }

    /// §4.6 steps 1-8, except plan submission (the caller retries that with
    /// a fresh snapshot on `PlannerRejected`).
    async fn build_plan(
        &self,
        snapshot: &dyn Snapshot,
        job: &Arc<Job>,
        eval: &Evaluation,
    ) -> Result<BuiltPlan, SchedulerError> {
        let allocs = snapshot.allocs_by_job(&eval.namespace, &eval.job_id, true).await?;
        let nodes = snapshot.nodes().await?;
        let config = snapshot.scheduler_config();

        let cluster = ClusterState {
            nodes: nodes.iter().map(|n| (n.id, n.status)).collect(),
            now: self.clock.now(),
        };

        let mut sorted_tgs: Vec<&TaskGroup> = job.task_groups.iter().collect();
        sorted_tgs.sort_by(|a, b| a.name.cmp(&b.name));

        // Pass 1: pure reconciliation per task group, and the set of
        // allocation ids that leave the node this evaluation (stops,
        // destructive-replaced originals, migrate sources) so accounting
        // for placements reflects freed capacity (§4.1 steps 1-2).
        let mut per_tg_desired: Vec<(&TaskGroup, Vec<Allocation>, TaskGroupDesiredChange)> = Vec::new();
        let mut retiring: std::collections::BTreeSet<Uuid> = std::collections::BTreeSet::new();
        let mut follow_up_evals = Vec::new();

        for tg in sorted_tgs.iter().copied() {
            let tg_allocs: Vec<Allocation> = allocs.iter().filter(|a| a.task_group == tg.name).cloned().collect();
            let change = detect_task_group_change(tg, &tg_allocs);
            let healthy_deadline = tg.update.as_ref().map(|u| u.healthy_deadline);
            let desired = reconcile_task_group(tg, &tg_allocs, &cluster, change, cluster.now, healthy_deadline);

            if let Some(follow_up) = scheduler_reconciler::next_evaluation(eval, &desired) {
                follow_up_evals.push(follow_up);
            }

            retiring.extend(desired.stop.iter().map(|s| s.alloc_id));
            retiring.extend(desired.migrate.iter().map(|m| m.alloc_id));
            retiring.extend(desired.destructive_update.iter().map(|d| d.old_alloc_id));

            per_tg_desired.push((tg, tg_allocs, desired));
        }

        let mut existing_by_node: BTreeMap<Uuid, Vec<(Allocation, JobRank)>> = BTreeMap::new();
        for alloc in &allocs {
            if retiring.contains(&alloc.id) || alloc.is_terminal() {
                continue;
            }
            existing_by_node.entry(alloc.node_id).or_default().push((
                alloc.clone(),
                JobRank { priority: job.priority, create_index: job.create_index },
            ));
        }
        let mut already_placed_by_node: BTreeMap<Uuid, Vec<Allocation>> = BTreeMap::new();

        let mut stack = Stack::new(stack_kind_for(job));
        stack.set_nodes(nodes.iter().cloned().collect());

        let mut plan = Plan::new(eval.id, job.priority);
        let mut desired_tg_updates: BTreeMap<String, DesiredTgUpdates> = BTreeMap::new();
        let mut failed_tg_allocs: BTreeMap<String, FailedTaskGroupAllocs> = BTreeMap::new();
        let mut any_blocked = false;

        let preempt_min_gap = config.preempt_min_gap.for_job_type(job.job_type);
        let preemption_cfg =
            Some(PreemptionConfig { requesting_priority: job.priority, preempt_min_gap });

        for (tg, tg_allocs, desired) in &per_tg_desired {
            let tg: &TaskGroup = tg;
            let mut summary = DesiredTgUpdates::default();

            for stop in &desired.stop {
                if let Some(alloc) = find_alloc(tg_allocs, stop.alloc_id) {
                    let mut updated = alloc.clone();
                    updated.desired_status = DesiredStatus::Stop;
                    plan.append_update(updated.node_id, NodeUpdateKind::Stop, updated);
                    summary.stop += 1;
                }
            }
            for inplace in &desired.in_place_update {
                if let Some(alloc) = find_alloc(tg_allocs, inplace.alloc_id) {
                    let mut updated = alloc.clone();
                    updated.job_version = job.version;
                    updated.inplace_hash = tg.inplace_hash;
                    plan.append_update(updated.node_id, NodeUpdateKind::InPlace, updated);
                    summary.inplace_update += 1;
                }
            }
            for migrate in &desired.migrate {
                if let Some(alloc) = find_alloc(tg_allocs, migrate.alloc_id) {
                    let mut updated = alloc.clone();
                    updated.desired_status = DesiredStatus::Stop;
                    plan.append_update(updated.node_id, NodeUpdateKind::Stop, updated);
                }
                summary.migrate += 1;
                let prev_node = find_alloc(tg_allocs, migrate.alloc_id).map(|a| a.node_id);
                self.place_one(
                    &mut stack,
                    job,
                    tg,
                    migrate.replacement.index,
                    migrate.replacement.previous_allocation,
                    prev_node,
                    false,
                    eval,
                    &existing_by_node,
                    &mut already_placed_by_node,
                    preemption_cfg,
                    &mut plan,
                    &mut summary,
                    &mut failed_tg_allocs,
                    &mut any_blocked,
                )?;
            }
            for destructive in &desired.destructive_update {
                if let Some(alloc) = find_alloc(tg_allocs, destructive.old_alloc_id) {
                    let mut updated = alloc.clone();
                    updated.desired_status = DesiredStatus::Stop;
                    plan.append_update(updated.node_id, NodeUpdateKind::Stop, updated);
                }
                summary.destructive_update += 1;
                self.place_one(
                    &mut stack,
                    job,
                    tg,
                    destructive.replacement.index,
                    destructive.replacement.previous_allocation,
                    None,
                    false,
                    eval,
                    &existing_by_node,
                    &mut already_placed_by_node,
                    preemption_cfg,
                    &mut plan,
                    &mut summary,
                    &mut failed_tg_allocs,
                    &mut any_blocked,
                )?;
            }
            for place in &desired.place {
                summary.place += 1;
                self.place_one(
                    &mut stack,
                    job,
                    tg,
                    place.index,
                    place.previous_allocation,
                    None,
                    false,
                    eval,
                    &existing_by_node,
                    &mut already_placed_by_node,
                    preemption_cfg,
                    &mut plan,
                    &mut summary,
                    &mut failed_tg_allocs,
                    &mut any_blocked,
                )?;
            }
            for canary in &desired.canary {
                summary.canary += 1;
                self.place_one(
                    &mut stack,
                    job,
                    tg,
                    canary.index,
                    canary.previous_allocation,
                    None,
                    true,
                    eval,
                    &existing_by_node,
                    &mut already_placed_by_node,
                    preemption_cfg,
                    &mut plan,
                    &mut summary,
                    &mut failed_tg_allocs,
                    &mut any_blocked,
                )?;
            }

            desired_tg_updates.insert(tg.name.clone(), summary);
        }

        Ok(BuiltPlan { plan, desired_tg_updates, failed_tg_allocs, follow_up_evals, any_blocked })
    }

    #[allow(clippy::too_many_arguments)]
    fn place_one(
        &self,
        stack: &mut Stack,
        job: &Arc<Job>,
        tg: &TaskGroup,
        index: u32,
        previous_allocation: Option<Uuid>,
        previous_node: Option<Uuid>,
        is_canary: bool,
        eval: &Evaluation,
        existing_by_node: &BTreeMap<Uuid, Vec<(Allocation, JobRank)>>,
        already_placed_by_node: &mut BTreeMap<Uuid, Vec<Allocation>>,
        preemption: Option<PreemptionConfig>,
        plan: &mut Plan,
        summary: &mut DesiredTgUpdates,
        failed_tg_allocs: &mut BTreeMap<String, FailedTaskGroupAllocs>,
        any_blocked: &mut bool,
    ) -> Result<(), SchedulerError> {
        stack.set_job(
            job.clone(),
            None,
            Arc::new(existing_by_node.clone()),
            Arc::new(BTreeMap::new()),
        );
        for (node_id, allocs) in already_placed_by_node.iter() {
            for alloc in allocs {
                stack.record_commit(*node_id, alloc.clone());
            }
        }

        let penalty_nodes: Arc<std::collections::BTreeSet<Uuid>> =
            Arc::new(previous_node.into_iter().collect());

        let opts = SelectOptions {
            preferred_nodes: Vec::new(),
            penalty_nodes,
            placement_ctx: Default::default(),
            alloc_index: index,
            preemption,
        };

        let Some(result) = stack.select(&tg.name, opts) else {
            failed_tg_allocs
                .entry(tg.name.clone())
                .or_insert_with(|| stack.metrics.to_failed_tg())
                .coalesced_failures += 1;
            *any_blocked = true;
            return Ok(());
        };

        let new_alloc_id = Uuid::new_v4();

        if let Some(preemption) = &result.preemption {
            for alloc_id in &preemption.alloc_ids {
                if let Some(existing) = existing_by_node
                    .get(&preemption.node_id)
                    .and_then(|allocs| allocs.iter().find(|(a, _)| a.id == *alloc_id))
                {
                    plan.append_preemption(preemption.node_id, existing.0.clone(), new_alloc_id);
                    summary.preemptions += 1;
                }
            }
        }

        let tasks: Vec<(String, scheduler_types::TaskResources)> =
            tg.tasks.iter().map(|t| (t.name.clone(), t.resources.clone())).collect();

        let preempted_ids: std::collections::BTreeSet<Uuid> = result
            .preemption
            .as_ref()
            .map(|p| p.alloc_ids.iter().copied().collect())
            .unwrap_or_default();
        let node_existing: Vec<&Allocation> = existing_by_node
            .get(&result.node.id)
            .map(|allocs| {
                allocs
                    .iter()
                    .map(|(a, _)| a)
                    .filter(|a| !preempted_ids.contains(&a.id))
                    .collect()
            })
            .unwrap_or_default();
        let node_placed = already_placed_by_node.get(&result.node.id).cloned().unwrap_or_default();

        let commit = NodeAccounting::build(&result.node, node_existing, node_placed.iter())
            .ok()
            .and_then(|mut acc| {
                acc.fits(&tasks, tg.ephemeral_disk_mb).ok()?;
                Some(acc.commit(&tasks, tg.ephemeral_disk_mb))
            });

        let (device_instance_ids, core_ids) = match commit {
            Some(c) => (c.device_instance_ids, c.core_ids),
            None => {
                SchedulerError::invariant_violation(format!(
                    "select chose node {} for {} but direct accounting rejects it",
                    result.node.id, tg.name
                ));
            }
        };

        let resources = AllocatedResources {
            tasks: tasks.into_iter().collect(),
            shared_disk_mb: tg.ephemeral_disk_mb,
            device_instance_ids,
            core_ids,
        };

        let alloc = Allocation {
            id: new_alloc_id,
            namespace: eval.namespace.clone(),
            job_id: job.id.clone(),
            job_version: job.version,
            node_id: result.node.id,
            task_group: tg.name.clone(),
            index,
            name: Allocation::indexed_name(&job.id, &tg.name, index),
            resources,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Pending,
            desired_transition: DesiredTransition::default(),
            previous_allocation,
            next_allocation: None,
            is_canary,
            destructive_hash: tg.destructive_hash,
            inplace_hash: tg.inplace_hash,
            reschedule_tracker: RescheduleTracker::default(),
            alloc_states: Vec::new(),
            create_index: 0,
            modify_index: 0,
        };

        // Identity signing is side-effect-free on the scheduling decision
        // itself (§6): a failure here is logged, not propagated, so a signer
        // outage never blocks placement.
        if let Err(err) = self.identity_signer.sign(&alloc.id.to_string()) {
            tracing::warn!(alloc_id = %alloc.id, error = %err, "identity signing failed for placed allocation");
        }

        already_placed_by_node.entry(result.node.id).or_default().push(alloc.clone());
        plan.append_placement(result.node.id, alloc);
        Ok(())
    }

    /// §4.6: the driver entry point. Side effects: plan submission,
    /// follow-up evaluation creation.
    #[tracing::instrument(skip_all, fields(eval_id = %eval.id, namespace = %eval.namespace, job_id = %eval.job_id))]
    pub async fn process(&self, eval: Evaluation, cancel: &CancellationToken) -> Result<ProcessResult, SchedulerError> {
        let snapshot = self.load_snapshot().await?;
        let config = snapshot.scheduler_config();

        if cancel.is_cancelled() {
            return Ok(abandoned(eval));
        }

        let job = snapshot.job_by_id(&eval.namespace, &eval.job_id).await?;
        let Some(job) = job else {
            return self.process_deregister(snapshot.as_ref(), eval, cancel).await;
        };

        let mut eval = eval;
        let mut attempts = 0u32;
        let mut current_snapshot = snapshot;
        loop {
            let built = self.build_plan(current_snapshot.as_ref(), &job, &eval).await?;

            if cancel.is_cancelled() {
                return Ok(abandoned(eval));
            }

            if built.plan.is_empty() && built.follow_up_evals.is_empty() && !built.any_blocked {
                eval.status = EvalStatus::Complete;
                eval.queued_allocations = BTreeMap::new();
                return Ok(ProcessResult {
                    eval,
                    plan: None,
                    follow_up_evals: Vec::new(),
                    outcome: ProcessOutcome::Complete,
                });
            }

            // An empty plan with `any_blocked` set (every placement failed and
            // there was nothing else to stop/update/migrate) still needs a
            // blocked follow-up evaluation (§4.6 step 8); fall through to the
            // normal submit-or-report path instead of short-circuiting above.
            if built.plan.is_empty() && built.any_blocked {
                for (tg_name, failed) in &built.failed_tg_allocs {
                    eval.failed_tg_allocs.insert(tg_name.clone(), failed.clone());
                }
                eval.queued_allocations = built
                    .desired_tg_updates
                    .iter()
                    .map(|(tg, updates)| (tg.clone(), updates.place))
                    .collect();
                eval.status = EvalStatus::Blocked;

                let mut follow_up_evals = built.follow_up_evals;
                let blocked = eval.follow_up(TriggerReason::QueuedAllocsBlocked, None);
                eval.blocked_eval = Some(blocked.id);
                follow_up_evals.push(blocked);

                return Ok(ProcessResult { eval, plan: None, follow_up_evals, outcome: ProcessOutcome::Blocked });
            }

            let submit_deadline = config.planner_deadline;
            let submitted = tokio::time::timeout(submit_deadline, self.planner.submit(built.plan.clone())).await;

            match submitted {
                Ok(Ok(_submission)) => {
                    for (tg_name, failed) in &built.failed_tg_allocs {
                        eval.failed_tg_allocs.insert(tg_name.clone(), failed.clone());
                    }
                    eval.queued_allocations = built
                        .desired_tg_updates
                        .iter()
                        .map(|(tg, updates)| (tg.clone(), if built.any_blocked { updates.place } else { 0 }))
                        .collect();
                    eval.status = if built.any_blocked { EvalStatus::Blocked } else { EvalStatus::Complete };

                    let mut follow_up_evals = built.follow_up_evals;
                    if built.any_blocked {
                        let blocked = eval.follow_up(TriggerReason::QueuedAllocsBlocked, None);
                        eval.blocked_eval = Some(blocked.id);
                        follow_up_evals.push(blocked);
                    }

                    let outcome = if built.any_blocked { ProcessOutcome::Blocked } else { ProcessOutcome::Complete };
                    return Ok(ProcessResult { eval, plan: Some(built.plan), follow_up_evals, outcome });
                }
                Ok(Err(SchedulerError::PlannerRejected { .. })) if attempts < config.planner_retry_limit => {
                    attempts += 1;
                    tokio::time::sleep(config.planner_retry_backoff).await;
                    if cancel.is_cancelled() {
                        return Ok(abandoned(eval));
                    }
                    current_snapshot = self.load_snapshot().await?;
                    continue;
                }
                Ok(Err(SchedulerError::PlannerRejected { eval_id, .. })) => {
                    eval.status = EvalStatus::Failed;
                    return Err(SchedulerError::PlannerRejected { eval_id, attempts });
                }
                Ok(Err(other)) => {
                    eval.status = EvalStatus::Failed;
                    return Err(other);
                }
                Err(_) => {
                    eval.status = EvalStatus::Failed;
                    return Err(SchedulerError::Timeout { operation: "planner submit" });
                }
            }
        }
    }

    async fn process_deregister(
        &self,
        snapshot: &dyn Snapshot,
        mut eval: Evaluation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, SchedulerError> {
        let allocs = snapshot.allocs_by_job(&eval.namespace, &eval.job_id, false).await?;

        if cancel.is_cancelled() {
            return Ok(abandoned(eval));
        }

        let mut plan = Plan::new(eval.id, eval.priority);
        for alloc in allocs {
            if alloc.is_terminal() {
                continue;
            }
            let mut updated = alloc.clone();
            updated.desired_status = DesiredStatus::Stop;
            plan.append_update(updated.node_id, NodeUpdateKind::Stop, updated);
        }

        if plan.is_empty() {
            eval.status = EvalStatus::Complete;
            return Ok(ProcessResult { eval, plan: None, follow_up_evals: Vec::new(), outcome: ProcessOutcome::Complete });
        }

        let submit_deadline = snapshot.scheduler_config().planner_deadline;
        match tokio::time::timeout(submit_deadline, self.planner.submit(plan.clone())).await {
            Ok(Ok(_)) => {
                eval.status = EvalStatus::Complete;
                Ok(ProcessResult { eval, plan: Some(plan), follow_up_evals: Vec::new(), outcome: ProcessOutcome::Complete })
            }
            Ok(Err(e)) => {
                eval.status = EvalStatus::Failed;
                Err(e)
            }
            Err(_) => {
                eval.status = EvalStatus::Failed;
                Err(SchedulerError::Timeout { operation: "planner submit" })
            }
        }
    }
}
