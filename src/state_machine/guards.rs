use super::events::DispatchEvent;
use super::states::DispatchStatus;
use crate::error::{DispatchError, DispatchResult};

/// Transition table for dispatch records
#[derive(Debug)]
pub struct TransitionGuard;

impl TransitionGuard {
    /// Resolve the target state for `event` applied in state `from`.
    ///
    /// Every edge of the lifecycle lives here; components never pick a target
    /// status on their own.
    pub fn transition(from: DispatchStatus, event: DispatchEvent) -> DispatchResult<DispatchStatus> {
        use DispatchEvent::*;
        use DispatchStatus::*;

        if from.is_terminal() {
            return Err(invalid(from, event));
        }

        let to = match (from, event) {
            (Pending, Published) => Queued,
            (Pending, ReconciliationRepublished) => Queued,

            (Pending | Queued | Retry, Claimed) => Sending,

            (Sending, TransportSucceeded) => Sent,
            (
                Sending,
                TransportFailed {
                    retry_count,
                    max_retry_count,
                },
            ) => resolve_failure(retry_count, max_retry_count),

            // Broker-level: the retry queue dead-letters back onto the main queue
            (Retry, Redelivered) => Queued,

            (Pending | Queued | Retry, TtlElapsed) => Expired,

            _ => return Err(invalid(from, event)),
        };

        Ok(to)
    }

    pub fn can_transition(from: DispatchStatus, event: DispatchEvent) -> bool {
        Self::transition(from, event).is_ok()
    }
}

/// Decide where a failed attempt goes.
///
/// `Retry` increments the counter, so a record that never succeeds is
/// attempted `max_retry_count + 1` times and fails with
/// `retry_count == max_retry_count`.
pub fn resolve_failure(retry_count: i32, max_retry_count: i32) -> DispatchStatus {
    if retry_count < max_retry_count {
        DispatchStatus::Retry
    } else {
        DispatchStatus::Failed
    }
}

fn invalid(from: DispatchStatus, event: DispatchEvent) -> DispatchError {
    DispatchError::InvalidTransition {
        from: from.to_string(),
        event: event.to_string(),
    }
}
