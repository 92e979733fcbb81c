//! Retry-then-ask-a-human policy.
//!
//! Pure function of (error class, attempt count); the job loop owns the
//! counters and the I/O.

use crate::error::ErrorClass;

/// Default number of retries before a tool failure is escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What the loop should do after a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Issue the same invocation again.
    Retry,
    /// Stop retrying and open an interrupt carrying the failure context.
    EscalateToHuman,
    /// End the job as failed.
    Fail,
}

/// Decide the next move after the `attempts`-th consecutive failure of a tool.
///
/// `attempts` is the counter value *after* recording the failure, so the
/// first failure is `1`.
pub fn decide(class: ErrorClass, attempts: u32, max_retries: u32) -> RetryDecision {
    match class {
        ErrorClass::NonRecoverable => RetryDecision::Fail,
        ErrorClass::Recoverable | ErrorClass::ProviderUnavailable => {
            if attempts <= max_retries {
                RetryDecision::Retry
            } else {
                RetryDecision::EscalateToHuman
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_up_to_cap_then_escalates() {
        for attempt in 1..=3 {
            assert_eq!(
                decide(ErrorClass::Recoverable, attempt, DEFAULT_MAX_RETRIES),
                RetryDecision::Retry
            );
        }
        assert_eq!(
            decide(ErrorClass::Recoverable, 4, DEFAULT_MAX_RETRIES),
            RetryDecision::EscalateToHuman
        );
    }

    #[test]
    fn test_provider_unavailable_follows_recoverable_policy() {
        assert_eq!(
            decide(ErrorClass::ProviderUnavailable, 2, 3),
            RetryDecision::Retry
        );
        assert_eq!(
            decide(ErrorClass::ProviderUnavailable, 4, 3),
            RetryDecision::EscalateToHuman
        );
    }

    #[test]
    fn test_non_recoverable_skips_retries() {
        assert_eq!(decide(ErrorClass::NonRecoverable, 1, 3), RetryDecision::Fail);
    }

    #[test]
    fn test_zero_cap_escalates_immediately() {
        assert_eq!(
            decide(ErrorClass::Recoverable, 1, 0),
            RetryDecision::EscalateToHuman
        );
    }
}
