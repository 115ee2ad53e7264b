//! Feasibility filtering, ranking, and stack composition (§4.1-§4.4).
//!
//! The chain is pull-based: every stage owns the stage below it and pulls
//! one node at a time, so a `Select` call only ever does as much work as the
//! scan limit demands (§9).

pub mod accounting;
pub mod constraints;
pub mod devices;
pub mod filters;
pub mod iterator;
pub mod metrics;
pub mod network;
pub mod preempt;
pub mod ranking;
pub mod stack;

pub use accounting::{Commit, NodeAccounting};
pub use constraints::PlacementContext;
pub use devices::DeviceAllocator;
pub use filters::ConstraintFilter;
pub use iterator::{FeasibleIterator, StaticSource};
pub use metrics::Metrics;
pub use network::NetworkIndex;
pub use preempt::{select_preemption, JobRank, ResourceShortfall};
pub use ranking::{RankingIterator, ScoredNode};
pub use stack::{SelectOptions, SelectResult, Stack, StackKind};
