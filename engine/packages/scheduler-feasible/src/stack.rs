//! C4 — stack composition (§4.4): the two pre-wired feasibility+ranking
//! pipelines and `Select`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use scheduler_types::{Allocation, Job, Node, TaskGroup};
use uuid::Uuid;

use crate::constraints::PlacementContext;
use crate::filters::{base_prereq_filter, csi_volume_filter, driver_health_filter, host_volume_filter, ConstraintFilter};
use crate::iterator::{FeasibleIterator, StaticSource};
use crate::metrics::Metrics;
use crate::preempt::JobRank;
use crate::ranking::{
    scan_limit, BinPackIterator, JobAntiAffinityIterator, LimitIterator, NodeAffinityIterator, PreemptionConfig,
    RankingIterator, RescheduleNodePenaltyIterator, ScoreNormalizationIterator, ScoredNode,
};

/// Hard ceiling on the computed scan limit; binds only for very large
/// clusters (§4.4: "capped at a small constant").
const SCAN_CAP: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Generic,
    System,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Nodes to try first, in order; the first feasible one short-circuits
    /// ranking entirely (§4.4).
    pub preferred_nodes: Vec<Uuid>,
    /// Previous node(s) of a rescheduled allocation (§C.3 of the expanded
    /// spec): a de-prioritization hint for the reschedule-penalty ranker,
    /// distinct from `preferred_nodes`.
    pub penalty_nodes: Arc<BTreeSet<Uuid>>,
    pub placement_ctx: PlacementContext,
    pub alloc_index: u32,
    pub preemption: Option<PreemptionConfig>,
}

#[derive(Debug, Clone)]
pub struct SelectResult {
    pub node: Arc<Node>,
    pub final_score: f64,
    pub scores: Vec<f64>,
    pub preemption: Option<crate::ranking::NodePreemption>,
    pub via_preferred_node: bool,
}

pub struct Stack {
    kind: StackKind,
    nodes: Vec<Arc<Node>>,
    scan_limit: u32,
    job: Option<Arc<Job>>,
    node_pool: Option<String>,
    existing_by_node: Arc<BTreeMap<Uuid, Vec<(Allocation, JobRank)>>>,
    already_placed_by_node: BTreeMap<Uuid, Vec<Allocation>>,
    volumes_in_use_per_plugin: Arc<BTreeMap<String, u32>>,
    class_cache: Arc<Mutex<HashMap<(String, u64), bool>>>,
    pub metrics: Metrics,
}

impl Stack {
    pub fn new(kind: StackKind) -> Self {
        Stack {
            kind,
            nodes: Vec::new(),
            scan_limit: 2,
            job: None,
            node_pool: None,
            existing_by_node: Arc::new(BTreeMap::new()),
            already_placed_by_node: BTreeMap::new(),
            volumes_in_use_per_plugin: Arc::new(BTreeMap::new()),
            class_cache: Arc::new(Mutex::new(HashMap::new())),
            metrics: Metrics::default(),
        }
    }

    /// §4.4: resets the feasibility source and recomputes the scan limit.
    pub fn set_nodes(&mut self, nodes: Vec<Arc<Node>>) {
        self.scan_limit = scan_limit(nodes.len(), SCAN_CAP);
        self.nodes = nodes;
    }

    /// §4.4: installs job constraints/priority and resets per-task-group
    /// filter state, including the computed-class cache.
    pub fn set_job(
        &mut self,
        job: Arc<Job>,
        node_pool: Option<String>,
        existing_by_node: Arc<BTreeMap<Uuid, Vec<(Allocation, JobRank)>>>,
        volumes_in_use_per_plugin: Arc<BTreeMap<String, u32>>,
    ) {
        self.job = Some(job);
        self.node_pool = node_pool;
        self.existing_by_node = existing_by_node;
        self.already_placed_by_node = BTreeMap::new();
        self.volumes_in_use_per_plugin = volumes_in_use_per_plugin;
        self.class_cache = Arc::new(Mutex::new(HashMap::new()));
    }

    /// Records a placement made this evaluation so subsequent `select` calls
    /// see the reduced capacity and updated collision counts (§4.1 step 2).
    pub fn record_commit(&mut self, node_id: Uuid, alloc: Allocation) {
        self.already_placed_by_node.entry(node_id).or_default().push(alloc);
    }

    fn collisions_by_node(&self, job_id: &str) -> BTreeMap<Uuid, u32> {
        let mut counts = BTreeMap::new();
        for (node_id, allocs) in self.existing_by_node.iter() {
            let n = allocs.iter().filter(|(a, _)| a.job_id == job_id).count() as u32;
            if n > 0 {
                *counts.entry(*node_id).or_default() += n;
            }
        }
        for (node_id, allocs) in &self.already_placed_by_node {
            *counts.entry(*node_id).or_default() += allocs.len() as u32;
        }
        counts
    }

    fn build_feasibility_chain(
        &self,
        job: &Arc<Job>,
        tg: &Arc<TaskGroup>,
        ctx: PlacementContext,
        alloc_index: u32,
    ) -> Box<dyn FeasibleIterator> {
        let source: Box<dyn FeasibleIterator> = Box::new(StaticSource::new(self.nodes.clone()));
        let source = base_prereq_filter(source, job.clone(), self.node_pool.clone());

        let mut constraints = job.constraints.clone();
        constraints.extend(tg.constraints.clone());
        let source: Box<dyn FeasibleIterator> =
            Box::new(ConstraintFilter::new(source, constraints, ctx, self.class_cache.clone()));

        let source = driver_health_filter(source, tg.clone());
        let source = host_volume_filter(source, tg.clone(), alloc_index);
        csi_volume_filter(source, tg.clone(), self.volumes_in_use_per_plugin.clone())
    }

    fn build_ranking_chain(
        &self,
        job: &Arc<Job>,
        tg: &Arc<TaskGroup>,
        feasible: Box<dyn FeasibleIterator>,
        opts: &SelectOptions,
    ) -> Box<dyn RankingIterator> {
        let tasks: Vec<(String, scheduler_types::TaskResources)> =
            tg.tasks.iter().map(|t| (t.name.clone(), t.resources.clone())).collect();

        // Whether preemption is attempted is entirely the caller's call
        // (§4.6 step 5 invokes it for the system scheduler too); the stack
        // itself doesn't gate it by kind.
        let mut chain: Box<dyn RankingIterator> = Box::new(BinPackIterator::new(
            feasible,
            self.existing_by_node.clone(),
            Arc::new(self.already_placed_by_node.clone()),
            tasks,
            tg.ephemeral_disk_mb,
            opts.preemption,
        ));

        if self.kind == StackKind::Generic {
            let collisions = Arc::new(self.collisions_by_node(&job.id));
            chain = Box::new(JobAntiAffinityIterator::new(chain, collisions, tg.count.max(1)));
        }

        chain = Box::new(RescheduleNodePenaltyIterator::new(chain, opts.penalty_nodes.clone()));

        let mut affinities = job.affinities.clone();
        affinities.extend(tg.affinities.clone());
        chain = Box::new(NodeAffinityIterator::new(chain, affinities, opts.placement_ctx.clone()));

        chain = Box::new(ScoreNormalizationIterator::new(chain));

        if self.kind == StackKind::Generic {
            chain = Box::new(LimitIterator::new(chain, self.scan_limit));
        }

        chain
    }

    /// §4.4: returns the best-scoring node from the scan limit, or a
    /// feasible `preferred_nodes` entry if one short-circuits the scan.
    pub fn select(&mut self, task_group: &str, opts: SelectOptions) -> Option<SelectResult> {
        self.metrics.reset();
        let job = self.job.clone()?;
        let tg = Arc::new(job.task_group(task_group)?.clone());

        if !opts.preferred_nodes.is_empty() {
            let preferred_set: BTreeSet<Uuid> = opts.preferred_nodes.iter().copied().collect();
            let preferred_nodes: Vec<Arc<Node>> = self.nodes.iter().filter(|n| preferred_set.contains(&n.id)).cloned().collect();
            if !preferred_nodes.is_empty() {
                let saved = std::mem::replace(&mut self.nodes, preferred_nodes);
                let feasible = self.build_feasibility_chain(&job, &tg, opts.placement_ctx.clone(), opts.alloc_index);
                let mut ranking = self.build_ranking_chain(&job, &tg, feasible, &opts);
                let hit = ranking.next(&mut self.metrics);
                self.nodes = saved;
                if let Some(scored) = hit {
                    return Some(SelectResult {
                        node: scored.node,
                        final_score: scored.final_score,
                        scores: scored.scores,
                        preemption: scored.preemption,
                        via_preferred_node: true,
                    });
                }
            }
        }

        let feasible = self.build_feasibility_chain(&job, &tg, opts.placement_ctx.clone(), opts.alloc_index);
        let mut ranking = self.build_ranking_chain(&job, &tg, feasible, &opts);

        let mut best: Option<ScoredNode> = None;
        while let Some(scored) = ranking.next(&mut self.metrics) {
            match &best {
                Some(b) if scored.final_score <= b.final_score => {}
                _ => best = Some(scored),
            }
        }

        best.map(|scored| SelectResult {
            node: scored.node,
            final_score: scored.final_score,
            scores: scored.scores,
            preemption: scored.preemption,
            via_preferred_node: false,
        })
    }
}
