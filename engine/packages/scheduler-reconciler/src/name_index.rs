//! Per-task-group allocation index bookkeeping (§4.5.3).

use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Tracks which `(task_group, index)` slots are in use, detects duplicate
/// claims (invariant 5, §8), and hands out indices for new placements,
/// scale-down stops, and canary slots.
#[derive(Debug, Clone, Default)]
pub struct AllocNameIndex {
    used: BTreeSet<u32>,
    duplicates: BTreeMap<u32, Vec<Uuid>>,
}

impl AllocNameIndex {
    pub fn build<'a>(allocs: impl IntoIterator<Item = (u32, &'a Uuid)>) -> Self {
        let mut seen: BTreeMap<u32, Vec<Uuid>> = BTreeMap::new();
        for (idx, id) in allocs {
            seen.entry(idx).or_default().push(*id);
        }
        let used = seen.keys().copied().collect();
        let duplicates = seen.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
        AllocNameIndex { used, duplicates }
    }

    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }

    pub fn duplicates(&self) -> &BTreeMap<u32, Vec<Uuid>> {
        &self.duplicates
    }

    /// Reserves and returns `count` ascending indices not currently in use.
    pub fn next_indices(&mut self, count: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(count as usize);
        let mut candidate = 0u32;
        while out.len() < count as usize {
            if !self.used.contains(&candidate) {
                self.used.insert(candidate);
                out.push(candidate);
            }
            candidate += 1;
        }
        out
    }

    /// Selects the `count` highest-indexed in-use slots for scale-down
    /// (§4.5.3 `stop`), without reserving/releasing them.
    pub fn highest_used(&self, count: u32) -> Vec<u32> {
        self.used.iter().rev().take(count as usize).copied().collect()
    }

    pub fn release(&mut self, index: u32) {
        self.used.remove(&index);
    }

    pub fn contains(&self, index: u32) -> bool {
        self.used.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}
