use std::time::Duration;

use rand::Rng;

/// Bounded, jittered retry schedule for credential lookups.
///
/// A lookup makes at most `max_attempts` tries. The pauses between them grow
/// geometrically from `initial_delay` and never add up to more than
/// `max_total_wait`, which is the worst-case extra latency for an unknown key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_total_wait: Duration,
}

impl LookupRetry {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(5);
    pub const DEFAULT_MAX_TOTAL_WAIT: Duration = Duration::from_millis(1000);
    const GROWTH_FACTOR: u32 = 3;

    pub fn new(max_attempts: u32, initial_delay: Duration, max_total_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_total_wait,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Pauses to take between consecutive attempts.
    pub fn delays(&self) -> Backoff {
        Backoff {
            remaining: self.max_attempts.saturating_sub(1),
            next: self.initial_delay,
            budget: self.max_total_wait,
        }
    }
}

impl Default for LookupRetry {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            Self::DEFAULT_INITIAL_DELAY,
            Self::DEFAULT_MAX_TOTAL_WAIT,
        )
    }
}

#[derive(Debug)]
pub struct Backoff {
    remaining: u32,
    next: Duration,
    budget: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        // Jitter into [next/2, next] so concurrent misses spread out.
        let ceiling = self.next.as_micros() as u64;
        let jittered = if ceiling > 1 {
            Duration::from_micros(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
        } else {
            self.next
        };
        let delay = jittered.min(self.budget);

        self.budget -= delay;
        self.next = self.next.saturating_mul(LookupRetry::GROWTH_FACTOR);
        Some(delay)
    }
}
