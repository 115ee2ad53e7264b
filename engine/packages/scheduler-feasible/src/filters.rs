//! C2 — feasibility iterators (§4.2). The fixed composition (steps 1-7) is
//! assembled by `crate::stack::build_feasibility_chain`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use scheduler_types::{Constraint, Job, Node, TaskGroup};

use crate::constraints::{constraint_matches, PlacementContext};
use crate::iterator::FeasibleIterator;
use crate::metrics::Metrics;

/// A filter defined purely by a predicate over `(&Node)`; used for the
/// prerequisite / driver-health / host-volume / CSI steps, which don't need
/// per-node scoring state, only a yes/no answer plus a metrics bump on "no".
pub struct PredicateFilter<F> {
    source: Box<dyn FeasibleIterator>,
    predicate: F,
    on_filtered: fn(&mut Metrics),
}

impl<F: FnMut(&Node) -> bool> PredicateFilter<F> {
    pub fn new(source: Box<dyn FeasibleIterator>, predicate: F, on_filtered: fn(&mut Metrics)) -> Self {
        PredicateFilter { source, predicate, on_filtered }
    }
}

impl<F: FnMut(&Node) -> bool> FeasibleIterator for PredicateFilter<F> {
    fn next(&mut self, metrics: &mut Metrics) -> Option<Arc<Node>> {
        loop {
            let node = self.source.next(metrics)?;
            if (self.predicate)(&node) {
                return Some(node);
            }
            (self.on_filtered)(metrics);
        }
    }

    fn reset(&mut self) {
        self.source.reset();
    }
}

/// Steps 1: datacenter, node pool, and ready-status prerequisites.
pub fn base_prereq_filter(source: Box<dyn FeasibleIterator>, job: Arc<Job>, node_pool: Option<String>) -> Box<dyn FeasibleIterator> {
    Box::new(PredicateFilter::new(
        source,
        move |n: &Node| {
            n.is_ready()
                && job.datacenters.iter().any(|dc| dc == &n.datacenter)
                && node_pool.as_ref().map(|p| p == &n.node_pool).unwrap_or(true)
        },
        |m| m.nodes_filtered += 1,
    ))
}

/// Step 4: driver health for every task in the task group.
pub fn driver_health_filter(source: Box<dyn FeasibleIterator>, tg: Arc<TaskGroup>) -> Box<dyn FeasibleIterator> {
    Box::new(PredicateFilter::new(
        source,
        move |n: &Node| tg.tasks.iter().all(|t| n.drivers.get(&t.driver).copied().unwrap_or(false)),
        |m| {
            m.filtered_by_constraint("driver");
        },
    ))
}

/// Step 5: host volumes, with per-allocation interpolated names
/// (`<source>[<idx>]`).
pub fn host_volume_filter(source: Box<dyn FeasibleIterator>, tg: Arc<TaskGroup>, alloc_index: u32) -> Box<dyn FeasibleIterator> {
    Box::new(PredicateFilter::new(
        source,
        move |n: &Node| {
            tg.host_volumes.iter().all(|hv| {
                let name = if hv.per_alloc {
                    format!("{}[{}]", hv.source, alloc_index)
                } else {
                    hv.source.clone()
                };
                n.plugins.host_volumes.iter().any(|v| v == &name)
            })
        },
        |m| {
            m.filtered_by_constraint("host-volumes");
        },
    ))
}

/// Step 6: CSI plugin health, max-volume headroom, and topology.
pub fn csi_volume_filter(
    source: Box<dyn FeasibleIterator>,
    tg: Arc<TaskGroup>,
    volumes_in_use_per_plugin: Arc<BTreeMap<String, u32>>,
) -> Box<dyn FeasibleIterator> {
    Box::new(PredicateFilter::new(
        source,
        move |n: &Node| {
            tg.csi_volumes.iter().all(|cv| {
                let Some(info) = n.plugins.csi_node.get(&cv.plugin_id) else {
                    return false;
                };
                if !info.healthy {
                    return false;
                }
                let used = volumes_in_use_per_plugin.get(&cv.plugin_id).copied().unwrap_or(0);
                if used >= info.max_volumes {
                    return false;
                }
                cv.required_topology_segments.iter().all(|required| {
                    required.iter().all(|(k, v)| info.topology_segments.get(k) == Some(v))
                })
            })
        },
        |m| {
            m.filtered_by_constraint("csi-volumes");
        },
    ))
}

/// Steps 2/3/7: job-level and task-group-level hard constraints, with the
/// computed-class cache (step 3) applied whenever the full constraint set
/// for a node doesn't escape it.
pub struct ConstraintFilter {
    source: Box<dyn FeasibleIterator>,
    constraints: Vec<Constraint>,
    ctx: PlacementContext,
    /// (class, constraint-set hash) -> feasible. Shared across every
    /// `Select` call for the same job (§4.2 step 3); `Stack::set_job`
    /// installs a fresh, empty map.
    class_cache: Arc<Mutex<HashMap<(String, u64), bool>>>,
}

impl ConstraintFilter {
    pub fn new(
        source: Box<dyn FeasibleIterator>,
        constraints: Vec<Constraint>,
        ctx: PlacementContext,
        class_cache: Arc<Mutex<HashMap<(String, u64), bool>>>,
    ) -> Self {
        ConstraintFilter { source, constraints, ctx, class_cache }
    }

    fn constraint_set_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.constraints.hash(&mut hasher);
        hasher.finish()
    }

    fn evaluate(&self, node: &Node) -> Result<(), &'static str> {
        for c in &self.constraints {
            if !constraint_matches(node, c, &self.ctx) {
                return Err(op_label(c));
            }
        }
        Ok(())
    }
}

fn op_label(c: &Constraint) -> &'static str {
    use scheduler_types::ConstraintOperand::*;
    match c.operand {
        Equal => "=",
        NotEqual => "!=",
        Less => "<",
        LessEqual => "<=",
        Greater => ">",
        GreaterEqual => ">=",
        Version => "version",
        Semver => "semver",
        Regexp => "regexp",
        Is => "is",
        IsNot => "is_not",
        SetContainsAny => "set_contains_any",
        SetContainsAll => "set_contains_all",
        DistinctHosts => "distinct_hosts",
        DistinctProperty => "distinct_property",
    }
}

impl FeasibleIterator for ConstraintFilter {
    fn next(&mut self, metrics: &mut Metrics) -> Option<Arc<Node>> {
        let escapes = self.constraints.iter().any(|c| c.escapes_computed_class());
        let set_hash = self.constraint_set_hash();

        loop {
            let node = self.source.next(metrics)?;

            if !escapes {
                let cached = self.class_cache.lock().unwrap().get(&(node.node_class.clone(), set_hash)).copied();
                if let Some(feasible) = cached {
                    if feasible {
                        return Some(node);
                    }
                    metrics.filtered_by_class(&node.node_class);
                    continue;
                }
            }

            match self.evaluate(&node) {
                Ok(()) => {
                    if !escapes {
                        self.class_cache.lock().unwrap().insert((node.node_class.clone(), set_hash), true);
                    }
                    return Some(node);
                }
                Err(op) => {
                    if !escapes {
                        self.class_cache.lock().unwrap().insert((node.node_class.clone(), set_hash), false);
                    }
                    metrics.filtered_by_constraint(op);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.source.reset();
        // The class cache is intentionally *not* cleared on reset: it is
        // invalidated only when the source job changes (§9), which is a new
        // `ConstraintFilter` instance via `Stack::set_job`.
    }
}
