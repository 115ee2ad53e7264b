//! Node entity (§3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resources::NodeResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Down,
    Disconnected,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiControllerInfo {
    pub plugin_id: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiNodeInfo {
    pub plugin_id: String,
    pub healthy: bool,
    pub max_volumes: u32,
    /// Topology segments this node's plugin instance satisfies.
    pub topology_segments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginFingerprints {
    pub host_volumes: Vec<String>,
    pub csi_node: BTreeMap<String, CsiNodeInfo>,
    pub csi_controller: BTreeMap<String, CsiControllerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: uuid::Uuid,
    pub datacenter: String,
    pub node_pool: String,
    /// Opaque, hashable computed-class key (§4.2 step 3).
    pub node_class: String,
    pub status: NodeStatus,
    pub scheduling_eligible: bool,
    pub attributes: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub total_resources: NodeResources,
    pub reserved_resources: NodeResources,
    pub plugins: PluginFingerprints,
    pub drivers: BTreeMap<String, bool>,
    pub max_allocs: u32,
}

impl Node {
    pub fn is_ready(&self) -> bool {
        matches!(self.status, NodeStatus::Ready) && self.scheduling_eligible
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.status, NodeStatus::Draining)
    }

    pub fn is_down_or_lost(&self) -> bool {
        matches!(self.status, NodeStatus::Down)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.status, NodeStatus::Disconnected)
    }

    /// Interpolate `${node.X}`, `${attr.X}` and `${meta.X}` references.
    /// Interpolation failures (unknown key) resolve to `None`, which callers
    /// treat as "no match" per §4.2.
    pub fn interpolate(&self, template: &str) -> Option<String> {
        if let Some(key) = template.strip_prefix("${node.").and_then(|s| s.strip_suffix('}')) {
            return match key {
                "unique.id" => Some(self.id.to_string()),
                "datacenter" => Some(self.datacenter.clone()),
                "node_pool" => Some(self.node_pool.clone()),
                "class" => Some(self.node_class.clone()),
                _ => None,
            };
        }
        if let Some(key) = template.strip_prefix("${attr.").and_then(|s| s.strip_suffix('}')) {
            return self.attributes.get(key).cloned();
        }
        if let Some(key) = template.strip_prefix("${meta.").and_then(|s| s.strip_suffix('}')) {
            return self.metadata.get(key).cloned();
        }
        Some(template.to_string())
    }
}
