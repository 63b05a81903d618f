// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff with jitter for retry loops.

use std::time::Duration;

use rand::Rng;

/// State of an exponential backoff sequence.
///
/// Delays double from `min` up to `max`, each multiplied by a random factor
/// in `[0.5, 1.0]` so that concurrent retriers do not synchronize.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    next: Duration,
    max: Duration,
    /// Remaining retries, or `None` for an unbounded sequence.
    remaining: Option<u32>,
}

impl ExponentialBackoff {
    /// Creates an unbounded backoff sequence.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            next: min,
            max,
            remaining: None,
        }
    }

    /// Creates a backoff sequence that yields at most `retries` delays.
    pub fn with_max_retries(min: Duration, max: Duration, retries: u32) -> Self {
        Self {
            next: min,
            max,
            remaining: Some(retries),
        }
    }

    /// Returns the next delay, or `None` once the retry budget is spent.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        match self.remaining.as_mut() {
            Some(0) => return None,
            Some(remaining) => *remaining -= 1,
            None => {}
        }
        let delay = self.next.mul_f64(rng.gen_range(0.5..=1.0));
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }

    /// Sleeps for the next delay; panics if the retry budget is spent.
    pub async fn wait<R: Rng>(&mut self, rng: &mut R) {
        let delay = self
            .next_delay(rng)
            .expect("wait() requires an unbounded backoff");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn delays_grow_and_saturate() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let mut rng = StdRng::seed_from_u64(0);

        let mut previous_cap = Duration::from_millis(100);
        for _ in 0..6 {
            let delay = backoff.next_delay(&mut rng).unwrap();
            assert!(delay <= previous_cap);
            assert!(delay >= previous_cap / 2);
            previous_cap = (previous_cap * 2).min(Duration::from_millis(400));
        }
    }

    #[test]
    fn bounded_sequence_exhausts() {
        let mut backoff = ExponentialBackoff::with_max_retries(
            Duration::from_millis(10),
            Duration::from_millis(10),
            2,
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert!(backoff.next_delay(&mut rng).is_some());
        assert!(backoff.next_delay(&mut rng).is_some());
        assert!(backoff.next_delay(&mut rng).is_none());
    }
}
