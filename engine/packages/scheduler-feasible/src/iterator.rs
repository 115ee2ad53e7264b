//! Pull-based iterator machinery (§4.2, §9: "model iterators as pull-based
//! state machines, not coroutines").

use std::sync::Arc;

use scheduler_types::Node;

use crate::metrics::Metrics;

/// A single-pass, lazy source of candidate nodes. Composition is by
/// ownership: each filter wraps a `source: Box<dyn FeasibleIterator>` and
/// pulls one node at a time from it.
pub trait FeasibleIterator {
    fn next(&mut self, metrics: &mut Metrics) -> Option<Arc<Node>>;

    /// Rewinds the iterator to scan the same node set again from the start.
    /// Used by `Stack::select` to re-scan after `set_nodes`/`set_job`.
    fn reset(&mut self);
}

/// The base of every feasibility chain: a fixed, ordered slice of nodes.
pub struct StaticSource {
    nodes: Vec<Arc<Node>>,
    cursor: usize,
}

impl StaticSource {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        StaticSource { nodes, cursor: 0 }
    }
}

impl FeasibleIterator for StaticSource {
    fn next(&mut self, metrics: &mut Metrics) -> Option<Arc<Node>> {
        let node = self.nodes.get(self.cursor).cloned();
        if node.is_some() {
            self.cursor += 1;
            metrics.nodes_evaluated += 1;
        }
        node
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
