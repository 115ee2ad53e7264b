//! Rolling-update staggering (§4.5.4): turns a task group's `FollowUpRequest`
//! into a linked follow-up evaluation when a destructive update was capped
//! by `max_parallel` this pass.

use scheduler_types::{Evaluation, TriggerReason};

use crate::desired_change::TaskGroupDesiredChange;

/// Builds the follow-up evaluation for `change`, if one is needed. The
/// caller is responsible for persisting the returned evaluation and linking
/// it via `current.next_eval`.
pub fn next_evaluation(current: &Evaluation, change: &TaskGroupDesiredChange) -> Option<Evaluation> {
    let follow_up = change.follow_up?;
    Some(current.follow_up(TriggerReason::RollingUpdate, Some(follow_up.wait_until)))
}
