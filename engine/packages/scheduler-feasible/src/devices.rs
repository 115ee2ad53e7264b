//! Per-node, per-plan-attempt device accounting (§3 DeviceAllocator, §4.1).

use scheduler_types::{DeviceAffinity, DeviceClassId, DeviceRequest, Node, NodeDeviceGroup};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct DeviceAllocator {
    free: BTreeMap<DeviceClassId, Vec<String>>,
}

impl DeviceAllocator {
    pub fn build(groups: &[NodeDeviceGroup], already_used: impl IntoIterator<Item = (DeviceClassId, Vec<String>)>) -> Self {
        let mut free: BTreeMap<DeviceClassId, Vec<String>> = BTreeMap::new();
        for g in groups {
            let id = DeviceClassId {
                vendor: g.vendor.clone(),
                kind: g.kind.clone(),
                name: g.name.clone(),
            };
            free.insert(id, g.instance_ids.clone());
        }
        for (id, used) in already_used {
            if let Some(instances) = free.get_mut(&id) {
                instances.retain(|i| !used.contains(i));
            }
        }
        DeviceAllocator { free }
    }

    pub fn has_match(&self, req: &DeviceRequest) -> bool {
        self.free.get(&req.id()).map(|v| v.len() as u32 >= req.count).unwrap_or(false)
    }

    /// Affinity score in `[0, 1]`: the fraction of the device request's
    /// affinities satisfied by the node carrying this device class, using
    /// the node's attributes/metadata as the match surface.
    pub fn affinity_score(&self, node: &Node, req: &DeviceRequest) -> f64 {
        if req.affinities.is_empty() {
            return 0.0;
        }
        let total_weight: i32 = req.affinities.iter().map(|a| a.weight.abs()).sum();
        if total_weight == 0 {
            return 0.0;
        }
        let matched: i32 = req
            .affinities
            .iter()
            .filter(|a| affinity_matches(node, a))
            .map(|a| a.weight)
            .sum();
        (matched as f64 / total_weight as f64).clamp(0.0, 1.0)
    }

    /// Selects and removes `count` instances for `req`, recording the chosen
    /// ids (§4.1 `commit`).
    pub fn commit(&mut self, req: &DeviceRequest) -> Option<Vec<String>> {
        let instances = self.free.get_mut(&req.id())?;
        if (instances.len() as u32) < req.count {
            return None;
        }
        let chosen: Vec<String> = instances.drain(0..req.count as usize).collect();
        Some(chosen)
    }
}

fn affinity_matches(node: &Node, affinity: &DeviceAffinity) -> bool {
    use scheduler_types::ConstraintOperand::*;
    let Some(lvalue) = node.interpolate(&affinity.ltarget) else {
        return false;
    };
    match affinity.operand {
        Equal | Is => lvalue == affinity.rtarget,
        NotEqual | IsNot => lvalue != affinity.rtarget,
        SetContainsAny => affinity.rtarget.split(',').any(|v| v == lvalue),
        SetContainsAll => affinity.rtarget.split(',').all(|v| lvalue.split(',').any(|l| l == v)),
        _ => lvalue == affinity.rtarget,
    }
}
