//! Retry policy as a value, with the sleep injected by the caller.

use std::time::Duration;

/// How many times to try, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * attempt` after the n-th failed attempt.
    Linear(Duration),
}

/// What the attempt closure wants the loop to do with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Done,
    Retry,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(base) => base.saturating_mul(attempt.max(1)),
        }
    }

    /// Run `attempt` until `classify` says done or attempts run out.
    ///
    /// Returns the last value produced. `sleep` is called between attempts only.
    pub fn run<T>(
        &self,
        mut attempt: impl FnMut(u32) -> T,
        classify: impl Fn(&T) -> Attempt,
        sleep: impl Fn(Duration),
    ) -> T {
        let max = self.max_attempts.max(1);
        let mut n = 1;
        loop {
            let value = attempt(n);
            if n >= max || classify(&value) == Attempt::Done {
                return value;
            }
            sleep(self.delay_after(n));
            n += 1;
        }
    }
}
