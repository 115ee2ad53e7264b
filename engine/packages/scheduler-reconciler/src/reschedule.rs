//! Reschedule classification (§4.5.2): delay computation and the
//! now/later/denied decision for a single failed allocation.

use chrono::{DateTime, Utc};
use scheduler_types::{Allocation, RescheduleDelayFunction, ReschedulePolicy};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RescheduleDecision {
    /// `next_reschedule_at <= now`: place this evaluation.
    Now { next_reschedule_at: DateTime<Utc> },
    /// Scheduled for a future evaluation.
    Later { next_reschedule_at: DateTime<Utc> },
    /// Policy attempts exhausted within the interval window.
    Denied,
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Computes the delay before the `attempt_index`'th (0-based) reschedule
/// attempt, per the policy's delay function, capped at `max_delay`.
pub fn compute_delay(policy: &ReschedulePolicy, attempt_index: u32) -> Duration {
    let scaled = match policy.delay_function {
        RescheduleDelayFunction::Constant => policy.delay,
        RescheduleDelayFunction::Exponential => {
            let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
            policy.delay.saturating_mul(factor.max(1))
        }
        RescheduleDelayFunction::Fibonacci => policy.delay.saturating_mul(fibonacci(attempt_index)),
    };
    scaled.min(policy.max_delay)
}

/// §4.5.2 and SPEC_FULL §C.2: `next_reschedule_at` is additionally clamped
/// to the task group's deployment `healthy_deadline`, when one is active, so
/// a followup is never scheduled past it.
pub fn classify_reschedule(
    alloc: &Allocation,
    policy: &ReschedulePolicy,
    now: DateTime<Utc>,
    healthy_deadline: Option<Duration>,
) -> RescheduleDecision {
    if !policy.unlimited {
        let window_start = now - chrono::Duration::from_std(policy.interval).unwrap_or(chrono::Duration::zero());
        let attempts_in_window = alloc
            .reschedule_tracker
            .events
            .iter()
            .filter(|e| e.reschedule_time >= window_start)
            .count() as u32;
        if attempts_in_window >= policy.attempts {
            return RescheduleDecision::Denied;
        }
    }

    let attempt_index = alloc.reschedule_tracker.events.len() as u32;
    let mut delay = compute_delay(policy, attempt_index);
    if let Some(deadline) = healthy_deadline {
        delay = delay.min(deadline);
    }

    let next_reschedule_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
    if next_reschedule_at <= now {
        RescheduleDecision::Now { next_reschedule_at }
    } else {
        RescheduleDecision::Later { next_reschedule_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_types::{RescheduleEvent, RescheduleTracker};
    use uuid::Uuid;

    fn alloc_with_events(n: usize) -> Allocation {
        use scheduler_types::{AllocatedResources, ClientStatus, DesiredStatus, DesiredTransition, JobVersion};
        let events = (0..n)
            .map(|_| RescheduleEvent {
                reschedule_time: Utc::now(),
                prev_alloc_id: Uuid::new_v4(),
                prev_node_id: Uuid::new_v4(),
                delay: Duration::from_secs(1),
            })
            .collect();
        Allocation {
            id: Uuid::new_v4(),
            namespace: "default".into(),
            job_id: "web".into(),
            job_version: JobVersion(0),
            node_id: Uuid::new_v4(),
            task_group: "app".into(),
            index: 0,
            name: "web.app[0]".into(),
            resources: AllocatedResources {
                tasks: Default::default(),
                shared_disk_mb: 0,
                device_instance_ids: Default::default(),
                core_ids: Default::default(),
            },
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Failed,
            desired_transition: DesiredTransition::default(),
            previous_allocation: None,
            next_allocation: None,
            is_canary: false,
            destructive_hash: 0,
            inplace_hash: 0,
            reschedule_tracker: RescheduleTracker { events, last_outcome: None },
            alloc_states: vec![],
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = ReschedulePolicy {
            attempts: 10,
            interval: Duration::from_secs(3600),
            delay: Duration::from_secs(10),
            delay_function: RescheduleDelayFunction::Exponential,
            max_delay: Duration::from_secs(35),
            unlimited: false,
        };
        assert_eq!(compute_delay(&policy, 0), Duration::from_secs(10));
        assert_eq!(compute_delay(&policy, 1), Duration::from_secs(20));
        assert_eq!(compute_delay(&policy, 2), Duration::from_secs(35)); // capped from 40
    }

    #[test]
    fn denies_once_attempts_exhausted_in_window() {
        let policy = ReschedulePolicy {
            attempts: 2,
            interval: Duration::from_secs(3600),
            delay: Duration::from_secs(10),
            delay_function: RescheduleDelayFunction::Constant,
            max_delay: Duration::from_secs(60),
            unlimited: false,
        };
        let alloc = alloc_with_events(2);
        assert_eq!(classify_reschedule(&alloc, &policy, Utc::now(), None), RescheduleDecision::Denied);
    }

    #[test]
    fn unlimited_policy_never_denies() {
        let policy = ReschedulePolicy {
            attempts: 0,
            interval: Duration::from_secs(3600),
            delay: Duration::from_secs(10),
            delay_function: RescheduleDelayFunction::Constant,
            max_delay: Duration::from_secs(60),
            unlimited: true,
        };
        let alloc = alloc_with_events(50);
        assert!(matches!(
            classify_reschedule(&alloc, &policy, Utc::now(), None),
            RescheduleDecision::Now { .. }
        ));
    }

    #[test]
    fn clamps_to_healthy_deadline() {
        let policy = ReschedulePolicy {
            attempts: 10,
            interval: Duration::from_secs(3600),
            delay: Duration::from_secs(120),
            delay_function: RescheduleDelayFunction::Constant,
            max_delay: Duration::from_secs(600),
            unlimited: false,
        };
        let alloc = alloc_with_events(0);
        let now = Utc::now();
        let decision = classify_reschedule(&alloc, &policy, now, Some(Duration::from_secs(30)));
        match decision {
            RescheduleDecision::Later { next_reschedule_at } => {
                assert!(next_reschedule_at <= now + chrono::Duration::seconds(31));
            }
            other => panic!("expected Later, got {other:?}"),
        }
    }
}
