//! Reconciler (C5, §4.5): taint classification, reschedule classification,
//! allocation name indexing, desired-change computation, and rolling-update
//! staggering.

pub mod desired_change;
pub mod name_index;
pub mod reschedule;
pub mod rolling;
pub mod taint;

pub use desired_change::{
    detect_task_group_change, DestructiveUpdateAction, FollowUpRequest, InPlaceUpdateAction, MigrateAction, PlaceAction,
    StopAction, TaskGroupChange, TaskGroupDesiredChange, reconcile_task_group,
};
pub use name_index::AllocNameIndex;
pub use reschedule::{classify_reschedule, compute_delay, RescheduleDecision};
pub use rolling::next_evaluation;
pub use taint::{classify_all, classify_alloc, ClusterState, TaintBucket};
