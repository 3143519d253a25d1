//! Bounded retry policy.
//!
//! Waiting for a shared resource with a sleep between attempts shows up in
//! a few places where no event to block on exists (descriptor slots freed
//! by an earlier request, most prominently). The policy carries the attempt
//! budget and interval; what to log, and when, stays with the caller.

use crate::hal::Hal;

/// Outcome of running a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The attempt closure reported success within the budget.
    Completed,
    /// The budget was exhausted without success.
    TimedOut,
}

/// A bounded busy-wait: up to `max_attempts` tries, `interval_ms` apart.
///
/// `slow_after` marks the attempt at which the caller's slow-path callback
/// fires once, so a stalled wait surfaces in the log well before the
/// budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub slow_after: u32,
}

impl Default for RetryPolicy {
    /// The descriptor allocation budget: 3000 attempts 10 ms apart, about
    /// 30 seconds, with the slow diagnostic after about 7 seconds.
    fn default() -> Self {
        Self {
            max_attempts: 3000,
            interval_ms: 10,
            slow_after: 700,
        }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it returns true or the budget is exhausted.
    ///
    /// `slow` is invoked exactly once, just before attempt number
    /// `slow_after`, if the wait gets that far.
    pub fn run<A, S>(&self, hal: &dyn Hal, mut attempt: A, mut slow: S) -> RetryOutcome
    where
        A: FnMut() -> bool,
        S: FnMut(),
    {
        for i in 0..self.max_attempts {
            if i == self.slow_after {
                slow();
            }
            if attempt() {
                return RetryOutcome::Completed;
            }
            hal.sleep_ms(self.interval_ms);
        }
        RetryOutcome::TimedOut
    }
}
