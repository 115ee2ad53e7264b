//! C3 — ranking iterators (§4.3). Each stage appends one component to a
//! per-node score vector; `ScoreNormalizationIterator` collapses it to a
//! single `FinalScore`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use scheduler_types::{Affinity, Allocation, Node, TaskResources};
use uuid::Uuid;

use crate::accounting::NodeAccounting;
use crate::constraints::PlacementContext;
use crate::iterator::FeasibleIterator;
use crate::metrics::Metrics;
use crate::preempt::{self, JobRank, ResourceShortfall};

#[derive(Debug, Clone)]
pub struct NodePreemption {
    pub node_id: Uuid,
    pub alloc_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Arc<Node>,
    pub scores: Vec<f64>,
    pub final_score: f64,
    pub preemption: Option<NodePreemption>,
}

/// Consumes feasible nodes and attaches a numeric score; composition mirrors
/// `FeasibleIterator` (pull-based, ownership-composed).
pub trait RankingIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode>;
    fn reset(&mut self);
}

/// First ranking stage: the bin-pack score (§4.1 `score`), with an opt-in
/// preemption attempt (§4.7) when a node doesn't fit outright.
pub struct BinPackIterator {
    source: Box<dyn FeasibleIterator>,
    existing_by_node: Arc<BTreeMap<Uuid, Vec<(Allocation, JobRank)>>>,
    already_placed_by_node: Arc<BTreeMap<Uuid, Vec<Allocation>>>,
    tasks: Vec<(String, TaskResources)>,
    shared_disk_mb: u64,
    preemption: Option<PreemptionConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct PreemptionConfig {
    pub requesting_priority: i32,
    pub preempt_min_gap: i32,
}

impl BinPackIterator {
    pub fn new(
        source: Box<dyn FeasibleIterator>,
        existing_by_node: Arc<BTreeMap<Uuid, Vec<(Allocation, JobRank)>>>,
        already_placed_by_node: Arc<BTreeMap<Uuid, Vec<Allocation>>>,
        tasks: Vec<(String, TaskResources)>,
        shared_disk_mb: u64,
        preemption: Option<PreemptionConfig>,
    ) -> Self {
        BinPackIterator {
            source,
            existing_by_node,
            already_placed_by_node,
            tasks,
            shared_disk_mb,
            preemption,
        }
    }

    fn build_accounting(&self, node: &Node, excluded: &BTreeSet<Uuid>) -> Option<NodeAccounting> {
        let empty_existing: Vec<(Allocation, JobRank)> = Vec::new();
        let existing = self.existing_by_node.get(&node.id).unwrap_or(&empty_existing);
        let placed = self.already_placed_by_node.get(&node.id).cloned().unwrap_or_default();

        let existing_allocs: Vec<&Allocation> = existing
            .iter()
            .map(|(a, _)| a)
            .filter(|a| !excluded.contains(&a.id))
            .collect();

        NodeAccounting::build(node, existing_allocs, placed.iter()).ok()
    }
}

impl RankingIterator for BinPackIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        loop {
            let node = self.source.next(metrics)?;

            let accounting = match self.build_accounting(&node, &BTreeSet::new()) {
                Some(a) => a,
                None => {
                    metrics.exhausted(scheduler_types::DimensionExhausted::NetworkInvalidNode);
                    continue;
                }
            };

            match accounting.fits(&self.tasks, self.shared_disk_mb) {
                Ok(()) => {
                    let score = accounting.score(&self.tasks);
                    return Some(ScoredNode {
                        node,
                        scores: vec![score],
                        final_score: 0.0,
                        preemption: None,
                    });
                }
                Err(dim) => {
                    metrics.exhausted(dim);
                    let Some(cfg) = self.preemption else { continue };

                    let required_cpu: i64 = self
                        .tasks
                        .iter()
                        .map(|(_, t)| match t.cpu {
                            scheduler_types::CpuRequest::Shares(s) => s as i64,
                            scheduler_types::CpuRequest::Cores { .. } => 0,
                        })
                        .sum();
                    let required_mem: i64 = self.tasks.iter().map(|(_, t)| t.memory.memory_mb as i64).sum();

                    let shortfall = ResourceShortfall {
                        cpu_shares: (required_cpu - accounting.free_cpu_shares()).max(0),
                        memory_mb: (required_mem - accounting.free_memory_mb()).max(0),
                        disk_mb: (self.shared_disk_mb as i64 - accounting.free_disk_mb()).max(0),
                    };

                    let empty_existing: Vec<(Allocation, JobRank)> = Vec::new();
                    let existing = self.existing_by_node.get(&node.id).unwrap_or(&empty_existing);
                    let candidates: Vec<(&Allocation, JobRank)> = existing.iter().map(|(a, r)| (a, *r)).collect();

                    let Some(chosen) =
                        preempt::select_preemption(&candidates, cfg.requesting_priority, cfg.preempt_min_gap, shortfall)
                    else {
                        continue;
                    };

                    let excluded: BTreeSet<Uuid> = chosen.iter().copied().collect();
                    let Some(post_preempt) = self.build_accounting(&node, &excluded) else {
                        continue;
                    };
                    if post_preempt.fits(&self.tasks, self.shared_disk_mb).is_err() {
                        continue;
                    }
                    let score = post_preempt.score(&self.tasks);
                    return Some(ScoredNode {
                        node: node.clone(),
                        scores: vec![score],
                        final_score: 0.0,
                        preemption: Some(NodePreemption { node_id: node.id, alloc_ids: chosen }),
                    });
                }
            }
        }
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// `−(collisions_on_node + 1) / desired_count`.
pub struct JobAntiAffinityIterator {
    source: Box<dyn RankingIterator>,
    collisions_by_node: Arc<BTreeMap<Uuid, u32>>,
    desired_count: u32,
}

impl JobAntiAffinityIterator {
    pub fn new(source: Box<dyn RankingIterator>, collisions_by_node: Arc<BTreeMap<Uuid, u32>>, desired_count: u32) -> Self {
        JobAntiAffinityIterator { source, collisions_by_node, desired_count }
    }
}

impl RankingIterator for JobAntiAffinityIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        let mut scored = self.source.next(metrics)?;
        let collisions = self.collisions_by_node.get(&scored.node.id).copied().unwrap_or(0);
        let denom = self.desired_count.max(1) as f64;
        scored.scores.push(-((collisions + 1) as f64) / denom);
        Some(scored)
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// Fixed `−1.0` for nodes in the penalty set (the previous node of a
/// rescheduled allocation), else `0.0`.
pub struct RescheduleNodePenaltyIterator {
    source: Box<dyn RankingIterator>,
    penalty_nodes: Arc<BTreeSet<Uuid>>,
}

impl RescheduleNodePenaltyIterator {
    pub fn new(source: Box<dyn RankingIterator>, penalty_nodes: Arc<BTreeSet<Uuid>>) -> Self {
        RescheduleNodePenaltyIterator { source, penalty_nodes }
    }
}

impl RankingIterator for RescheduleNodePenaltyIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        let mut scored = self.source.next(metrics)?;
        let penalty = if self.penalty_nodes.contains(&scored.node.id) { -1.0 } else { 0.0 };
        scored.scores.push(penalty);
        Some(scored)
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// Sum of matching affinity weights over the sum of absolute weights of all
/// task-group affinities; nodes matching none still score `0`.
pub struct NodeAffinityIterator {
    source: Box<dyn RankingIterator>,
    affinities: Vec<Affinity>,
    ctx: PlacementContext,
}

impl NodeAffinityIterator {
    pub fn new(source: Box<dyn RankingIterator>, affinities: Vec<Affinity>, ctx: PlacementContext) -> Self {
        NodeAffinityIterator { source, affinities, ctx }
    }
}

impl RankingIterator for NodeAffinityIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        let mut scored = self.source.next(metrics)?;

        let total_weight: f64 = self.affinities.iter().map(|a| a.weight.unsigned_abs() as f64).sum();
        let score = if total_weight == 0.0 {
            0.0
        } else {
            let matched: f64 = self
                .affinities
                .iter()
                .filter(|a| {
                    let synthetic = scheduler_types::Constraint {
                        ltarget: a.ltarget.clone(),
                        operand: a.operand,
                        rtarget: a.rtarget.clone(),
                    };
                    crate::constraints::constraint_matches(&scored.node, &synthetic, &self.ctx)
                })
                .map(|a| a.weight as f64)
                .sum();
            matched / total_weight
        };

        scored.scores.push(score);
        Some(scored)
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// Terminal stage: collapses the score vector into `final_score` as the
/// arithmetic mean of its components.
pub struct ScoreNormalizationIterator {
    source: Box<dyn RankingIterator>,
}

impl ScoreNormalizationIterator {
    pub fn new(source: Box<dyn RankingIterator>) -> Self {
        ScoreNormalizationIterator { source }
    }
}

impl RankingIterator for ScoreNormalizationIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        let mut scored = self.source.next(metrics)?;
        scored.final_score = if scored.scores.is_empty() {
            0.0
        } else {
            scored.scores.iter().sum::<f64>() / scored.scores.len() as f64
        };
        Some(scored)
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// Bounds the number of scored nodes produced per `Select` call (§4.4's
/// "two random choices" scan-limit approximation).
pub struct LimitIterator {
    source: Box<dyn RankingIterator>,
    limit: u32,
    produced: u32,
}

impl LimitIterator {
    pub fn new(source: Box<dyn RankingIterator>, limit: u32) -> Self {
        LimitIterator { source, limit, produced: 0 }
    }
}

impl RankingIterator for LimitIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<ScoredNode> {
        if self.produced >= self.limit {
            return None;
        }
        let scored = self.source.next(metrics)?;
        self.produced += 1;
        Some(scored)
    }

    fn reset(&mut self) {
        self.source.reset();
        self.produced = 0;
    }
}

/// `max(2, ceil(sqrt(n)))`, capped at `cap` (§4.4).
pub fn scan_limit(n: usize, cap: u32) -> u32 {
    let base = (n as f64).sqrt().ceil() as u32;
    base.max(2).min(cap)
}
