//! Constraint/affinity evaluation against a node (§4.2).

use scheduler_types::{Constraint, ConstraintOperand, Node};
use std::collections::{BTreeMap, BTreeSet};

/// Cross-allocation state needed by `distinct_hosts`/`distinct_property`,
/// maintained by the caller (the scheduler driver) across `Select` calls
/// within one evaluation — the stack itself only sees one allocation slot
/// at a time (§4.4).
#[derive(Debug, Clone, Default)]
pub struct PlacementContext {
    pub used_nodes: BTreeSet<uuid::Uuid>,
    /// target template -> set of values already claimed by other
    /// allocations of this job for that target.
    pub distinct_property_values: BTreeMap<String, BTreeSet<String>>,
}

pub fn constraint_matches(node: &Node, c: &Constraint, ctx: &PlacementContext) -> bool {
    use ConstraintOperand::*;
    match c.operand {
        DistinctHosts => !ctx.used_nodes.contains(&node.id),
        DistinctProperty => {
            let Some(value) = node.interpolate(&c.ltarget) else {
                return false;
            };
            !ctx.distinct_property_values
                .get(&c.ltarget)
                .map(|s| s.contains(&value))
                .unwrap_or(false)
        }
        _ => {
            let Some(lvalue) = node.interpolate(&c.ltarget) else {
                return false;
            };
            scalar_matches(&lvalue, c.operand, &c.rtarget)
        }
    }
}

fn scalar_matches(lvalue: &str, op: ConstraintOperand, rtarget: &str) -> bool {
    use ConstraintOperand::*;
    match op {
        Equal | Is => lvalue == rtarget,
        NotEqual | IsNot => lvalue != rtarget,
        Less => numeric(lvalue, rtarget, |a, b| a < b),
        LessEqual => numeric(lvalue, rtarget, |a, b| a <= b),
        Greater => numeric(lvalue, rtarget, |a, b| a > b),
        GreaterEqual => numeric(lvalue, rtarget, |a, b| a >= b),
        Regexp => regex_match(rtarget, lvalue),
        SetContainsAny => rtarget.split(',').map(str::trim).any(|v| v == lvalue || lvalue.split(',').any(|l| l.trim() == v)),
        SetContainsAll => rtarget
            .split(',')
            .map(str::trim)
            .all(|v| lvalue.split(',').map(str::trim).any(|l| l == v)),
        Version | Semver => semver_range_matches(lvalue, rtarget),
        DistinctHosts | DistinctProperty => unreachable!("handled by constraint_matches"),
    }
}

fn numeric(lvalue: &str, rtarget: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (lvalue.parse::<f64>(), rtarget.parse::<f64>()) {
        (Ok(l), Ok(r)) => cmp(l, r),
        _ => false,
    }
}

/// Regex matching delegates to the `regex` crate rather than a hand-rolled
/// matcher — a substring/anchor approximation silently mismatches patterns
/// using character classes, alternation, or quantifiers (`linux|darwin`,
/// `gpu[0-9]+`), which is wrong feasibility, not a missing nicety. An
/// invalid pattern never matches rather than erroring, consistent with
/// every other operand here returning `false` on unparseable input.
fn regex_match(pattern: &str, value: &str) -> bool {
    regex::Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false)
}

/// Accepts "op x.y.z" comma-separated clauses, e.g. ">= 1.2.0, < 2.0.0"; a
/// clause with no operator means exact match, so it's normalized to `=`
/// before being handed to `semver`'s own requirement parser/comparator.
fn semver_range_matches(lvalue: &str, rtarget: &str) -> bool {
    let Ok(version) = semver::Version::parse(lvalue.trim_start_matches('v')) else {
        return false;
    };

    let normalized: Vec<String> = rtarget
        .split(',')
        .map(str::trim)
        .map(|clause| {
            let clause = clause.strip_prefix("==").map(|rest| format!("={}", rest.trim())).unwrap_or_else(|| clause.to_string());
            if clause.starts_with(['=', '<', '>', '^', '~']) {
                clause
            } else {
                format!("={clause}")
            }
        })
        .collect();

    let Ok(req) = semver::VersionReq::parse(&normalized.join(", ")) else {
        return false;
    };
    req.matches(&version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_types::{NodeResources, NodeStatus, PluginFingerprints};

    fn node() -> Node {
        let mut attrs = BTreeMap::new();
        attrs.insert("kernel.version".to_string(), "5.15.0".to_string());
        Node {
            id: uuid::Uuid::new_v4(),
            datacenter: "dc1".into(),
            node_pool: "default".into(),
            node_class: "c".into(),
            status: NodeStatus::Ready,
            scheduling_eligible: true,
            attributes: attrs,
            metadata: BTreeMap::new(),
            total_resources: NodeResources {
                cpu_shares: 0,
                cores_by_numa_node: BTreeMap::new(),
                memory_mb: 0,
                disk_mb: 0,
                host_networks: vec![],
                devices: vec![],
            },
            reserved_resources: NodeResources {
                cpu_shares: 0,
                cores_by_numa_node: BTreeMap::new(),
                memory_mb: 0,
                disk_mb: 0,
                host_networks: vec![],
                devices: vec![],
            },
            plugins: PluginFingerprints::default(),
            drivers: BTreeMap::new(),
            max_allocs: 0,
        }
    }

    #[test]
    fn version_constraint_matches_range() {
        let n = node();
        let c = Constraint {
            ltarget: "${attr.kernel.version}".into(),
            operand: ConstraintOperand::Version,
            rtarget: ">= 5.10.0, < 6.0.0".into(),
        };
        assert!(constraint_matches(&n, &c, &PlacementContext::default()));
    }

    #[test]
    fn regexp_constraint_matches_alternation_and_class() {
        let mut n = node();
        n.attributes.insert("kernel.name".to_string(), "darwin".to_string());
        let c = Constraint {
            ltarget: "${attr.kernel.name}".into(),
            operand: ConstraintOperand::Regexp,
            rtarget: "^(linux|darwin)$".into(),
        };
        assert!(constraint_matches(&n, &c, &PlacementContext::default()));

        n.attributes.insert("gpu.name".to_string(), "gpu7".to_string());
        let c = Constraint {
            ltarget: "${attr.gpu.name}".into(),
            operand: ConstraintOperand::Regexp,
            rtarget: "^gpu[0-9]+$".into(),
        };
        assert!(constraint_matches(&n, &c, &PlacementContext::default()));
    }

    #[test]
    fn distinct_hosts_excludes_used_node() {
        let n = node();
        let mut ctx = PlacementContext::default();
        ctx.used_nodes.insert(n.id);
        let c = Constraint {
            ltarget: String::new(),
            operand: ConstraintOperand::DistinctHosts,
            rtarget: String::new(),
        };
        assert!(!constraint_matches(&n, &c, &ctx));
    }

    #[test]
    fn unset_interpolation_never_matches() {
        let n = node();
        let c = Constraint {
            ltarget: "${attr.does.not.exist}".into(),
            operand: ConstraintOperand::Equal,
            rtarget: "x".into(),
        };
        assert!(!constraint_matches(&n, &c, &PlacementContext::default()));
    }
}
