//! Reconnect backoff: `min(2^attempt, 60s) + uniform[0, 2s]` jitter,
//! resetting to attempt 0 on a successful stream establishment (spec.md
//! §4.6). `Backoff::next_delay` never returns more than 62s (spec.md §8
//! boundary behavior).

use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { attempt: 0 }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Computes the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let capped_exp = 2u64.saturating_pow(self.attempt.min(6));
        let base = capped_exp.min(60);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::thread_rng().gen_range(0..2000);
        Duration::from_secs(base) + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_62_seconds() {
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(62), "delay was {delay:?}");
        }
    }

    #[test]
    fn delay_grows_with_attempt_count_until_the_cap() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        // Not a strict inequality because of jitter, but the base component
        // should have at least doubled.
        assert!(second.as_secs() + 1 >= first.as_secs());
    }

    #[test]
    fn reset_returns_attempt_to_zero() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay < Duration::from_secs(3));
    }
}
