use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
    /// Fraction of the base delay applied as random jitter in both directions.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Delay schedule for stream reconnects.
///
/// The first attempt after `reset()` is immediate. Every later attempt waits the
/// current base delay plus jitter, then grows the base by `backoff_factor` up to
/// `max_delay_millis`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: u64,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base_millis: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0;
    }

    /// Makes the next attempt wait the maximum delay, e.g. after `ResourceExhausted`.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.settings.max_delay_millis;
    }

    pub fn current_base_millis(&self) -> u64 {
        self.current_base_millis
    }

    /// Returns how long to wait before the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered_delay_millis(self.current_base_millis, self.settings.jitter_factor, rng);

        let next = (self.current_base_millis as f64) * self.settings.backoff_factor;
        self.current_base_millis = (next.round() as u64)
            .max(self.settings.initial_delay_millis)
            .min(self.settings.max_delay_millis);

        Duration::from_millis(delay)
    }
}

fn jittered_delay_millis<R: Rng + ?Sized>(base_millis: u64, jitter_factor: f64, rng: &mut R) -> u64 {
    if base_millis == 0 {
        return 0;
    }
    let base = base_millis as f64;
    let jitter = jitter_factor * base * rng.gen_range(-1.0..=1.0);
    (base + jitter).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate_then_grows() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base_millis(), 1_000);

        let second = backoff.next_delay_with_rng(&mut rng).as_millis() as u64;
        assert!((500..=1_500).contains(&second));
        assert_eq!(backoff.current_base_millis(), 1_500);
    }

    #[test]
    fn base_delay_is_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        for _ in 0..40 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as u64;
            assert!(delay <= DEFAULT_MAX_DELAY_MILLIS + DEFAULT_MAX_DELAY_MILLIS / 2);
        }
        assert_eq!(backoff.current_base_millis(), DEFAULT_MAX_DELAY_MILLIS);
    }

    #[test]
    fn reset_to_max_and_reset() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = ExponentialBackoff::new(BackoffSettings::default());
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as u64;
        assert!(delay >= DEFAULT_MAX_DELAY_MILLIS / 2);

        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
