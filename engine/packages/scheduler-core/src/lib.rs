//! Scheduler core (C6/C7/C8, §4.6-§4.8): the evaluation-processing driver
//! that composes `scheduler-feasible` and `scheduler-reconciler` behind the
//! external collaborator contracts in §6.

pub mod collaborators;
pub mod config;
pub mod driver;
pub mod error;

pub use collaborators::{CsiVolumeInfo, IdentitySigner, Planner, PlannerSubmission, RescheduleClock, Snapshot, SnapshotSource, SystemClock};
pub use config::{BlockedEvalPolicy, PreemptMinGap, SchedulerConfig};
pub use driver::{CancellationToken, ProcessOutcome, ProcessResult, Scheduler};
pub use error::SchedulerError;
