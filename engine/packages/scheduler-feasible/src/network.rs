//! Per-node, per-plan-attempt port accounting (§3 NetworkIndex, §4.1).

use scheduler_types::{HostNetwork, NetworkRequest};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIndexError;

/// Reserved ports per host-network address. Reservations from multiple
/// allocations on the *same address* merge; they are not collisions. A
/// collision only occurs when a new reservation overlaps an existing one on
/// the same address.
#[derive(Debug, Clone, Default)]
pub struct NetworkIndex {
    /// address -> reserved ports
    reserved: BTreeMap<String, BTreeSet<u16>>,
    /// alias -> address, to resolve `PortRequest::host_network`.
    aliases: BTreeMap<String, String>,
    default_address: Option<String>,
    /// Dynamic ports are handed out from this pool per address.
    dynamic_range: (u16, u16),
}

pub enum PortOutcome {
    Collision,
    Assigned { address: String, port: u16 },
}

impl NetworkIndex {
    /// Builds the index from node host networks plus already-reserved ports
    /// from allocations currently resident on the node (after filtering
    /// stopped/preempted allocs, per §4.1). A malformed reserved-port entry
    /// (out of the valid port range) is a parse failure that marks the node
    /// infeasible (`network: invalid node`).
    pub fn build(
        host_networks: &[HostNetwork],
        existing_reservations: impl IntoIterator<Item = (Option<String>, Vec<u16>)>,
    ) -> Result<Self, NetworkIndexError> {
        let mut idx = NetworkIndex {
            reserved: BTreeMap::new(),
            aliases: BTreeMap::new(),
            default_address: host_networks.first().map(|h| h.address.clone()),
            dynamic_range: (20000, 32000),
        };

        for hn in host_networks {
            idx.aliases.insert(hn.alias.clone(), hn.address.clone());
            let bucket = idx.reserved.entry(hn.address.clone()).or_default();
            for &p in &hn.reserved_ports {
                if p == 0 {
                    return Err(NetworkIndexError);
                }
                bucket.insert(p);
            }
        }

        for (alias, ports) in existing_reservations {
            let address = idx.resolve_address(alias.as_deref());
            let Some(address) = address else {
                return Err(NetworkIndexError);
            };
            let bucket = idx.reserved.entry(address).or_default();
            for p in ports {
                bucket.insert(p);
            }
        }

        Ok(idx)
    }

    fn resolve_address(&self, alias: Option<&str>) -> Option<String> {
        match alias {
            Some(a) => self.aliases.get(a).cloned().or_else(|| Some(a.to_string())),
            None => self.default_address.clone(),
        }
    }

    /// Attempts to reserve every port in `req`. Returns the merged
    /// reservations to commit, or a collision.
    pub fn try_reserve(&self, req: &NetworkRequest) -> PortOutcome {
        // Work on a scratch copy per address so a partial reservation from
        // this request doesn't get committed on failure.
        let mut scratch: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
        for port in &req.ports {
            let Some(address) = self.resolve_address(port.host_network.as_deref()) else {
                return PortOutcome::Collision;
            };
            let taken = self.reserved.get(&address);
            let scratch_bucket = scratch.entry(address.clone()).or_default();

            let value = match port.value {
                Some(v) => v,
                None => {
                    let mut candidate = None;
                    for p in self.dynamic_range.0..=self.dynamic_range.1 {
                        let occupied = taken.map(|t| t.contains(&p)).unwrap_or(false) || scratch_bucket.contains(&p);
                        if !occupied {
                            candidate = Some(p);
                            break;
                        }
                    }
                    match candidate {
                        Some(p) => p,
                        None => return PortOutcome::Collision,
                    }
                }
            };

            let occupied = taken.map(|t| t.contains(&value)).unwrap_or(false) || scratch_bucket.contains(&value);
            if occupied {
                return PortOutcome::Collision;
            }
            scratch_bucket.insert(value);
        }

        // Only the first scratch entry is meaningfully reported for single
        // port requests; multi-address requests are merged by the caller
        // via `commit`.
        let (address, ports) = scratch.into_iter().next().unwrap_or_default();
        let port = ports.into_iter().next().unwrap_or(0);
        PortOutcome::Assigned { address, port }
    }

    pub fn commit(&mut self, address: &str, port: u16) {
        self.reserved.entry(address.to_string()).or_default().insert(port);
    }

    pub fn has_collision(&self, address: &str, port: u16) -> bool {
        self.reserved.get(address).map(|s| s.contains(&port)).unwrap_or(false)
    }
}
