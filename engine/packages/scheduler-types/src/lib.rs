//! Shared value types for the cluster workload scheduler core.
//!
//! This crate has no I/O and no async: it is the `§3 DATA MODEL` of the
//! scheduler, shared by `scheduler-feasible`, `scheduler-reconciler` and
//! `scheduler-core`.

pub mod allocation;
pub mod constraint;
pub mod evaluation;
pub mod job;
pub mod node;
pub mod plan;
pub mod resources;

pub use allocation::*;
pub use constraint::*;
pub use evaluation::*;
pub use job::*;
pub use node::*;
pub use plan::*;
pub use resources::*;

pub type NodeId = uuid::Uuid;
pub type JobId = String;
pub type AllocId = uuid::Uuid;
pub type EvalId = uuid::Uuid;

/// A job identity is namespace-scoped; two jobs in different namespaces may
/// share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NamespacedJobId {
    pub namespace: String,
    pub job_id: JobId,
}

impl std::fmt::Display for NamespacedJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.job_id)
    }
}
