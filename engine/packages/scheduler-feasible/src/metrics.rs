//! Per-evaluation metrics, reset on every `Stack::select` call (§4.4, §9).

use scheduler_types::DimensionExhausted;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_in_pool: u32,
    pub nodes_available_by_dc: BTreeMap<String, u32>,
    pub class_filtered: BTreeMap<String, u32>,
    pub constraint_filtered: BTreeMap<String, u32>,
    pub dimension_exhausted: BTreeMap<DimensionExhausted, u32>,
    pub allocation_time: Duration,
}

impl Metrics {
    pub fn reset(&mut self) {
        *self = Metrics::default();
    }

    pub fn filtered_by_constraint(&mut self, op: &str) {
        *self.constraint_filtered.entry(op.to_string()).or_default() += 1;
        self.nodes_filtered += 1;
    }

    pub fn filtered_by_class(&mut self, class: &str) {
        *self.class_filtered.entry(class.to_string()).or_default() += 1;
        self.nodes_filtered += 1;
    }

    pub fn exhausted(&mut self, dim: DimensionExhausted) {
        *self.dimension_exhausted.entry(dim).or_default() += 1;
    }

    pub fn to_failed_tg(&self) -> scheduler_types::FailedTaskGroupAllocs {
        scheduler_types::FailedTaskGroupAllocs {
            nodes_evaluated: self.nodes_evaluated,
            nodes_filtered: self.nodes_filtered,
            nodes_in_pool: self.nodes_in_pool,
            nodes_available_by_dc: self.nodes_available_by_dc.clone(),
            class_filtered: self.class_filtered.clone(),
            constraint_filtered: self.constraint_filtered.clone(),
            dimension_exhausted: self
                .dimension_exhausted
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            coalesced_failures: 0,
            allocation_time: self.allocation_time,
        }
    }
}
