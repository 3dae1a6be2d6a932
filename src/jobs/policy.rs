//! Retry policies.

use std::time::Duration;

/// How many times a job may run and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// One attempt; any failure is terminal.
    NoRetry,
    /// Up to `attempts` runs, `delay` apart.
    Fixed { attempts: u32, delay: Duration },
    /// Up to `attempts` runs; waits grow along the Fibonacci sequence
    /// (`base`, `base`, `2*base`, `3*base`, `5*base`, ...) up to `max_delay`.
    Fibonacci {
        attempts: u32,
        base: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fibonacci {
            attempts: 5,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Total attempt budget, including the first run.
    pub fn max_attempts(&self) -> u32 {
        match *self {
            RetryPolicy::NoRetry => 1,
            RetryPolicy::Fixed { attempts, .. } | RetryPolicy::Fibonacci { attempts, .. } => {
                attempts.max(1)
            }
        }
    }

    /// Wait after the `attempt`-th failed run (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::NoRetry => Duration::ZERO,
            RetryPolicy::Fixed { delay, .. } => delay,
            RetryPolicy::Fibonacci { base, max_delay, .. } => {
                let factor = u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max_delay).min(max_delay)
            }
        }
    }
}

/// fib(1) = fib(2) = 1, saturating.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
