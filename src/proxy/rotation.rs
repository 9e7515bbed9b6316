use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sticky session rotation window
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RotationSettings {
    /// Nominal session lifetime in minutes
    pub base_minutes: f64,
    /// Fraction of `base_minutes` added or removed at random
    pub jitter_fraction: f64,
    /// Lower bound after jitter
    pub min_minutes: f64,
    /// Upper bound after jitter
    pub max_minutes: f64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            base_minutes: 10.0,
            jitter_fraction: 0.3,
            min_minutes: 5.0,
            max_minutes: 15.0,
        }
    }
}

impl RotationSettings {
    /// Draw a rotation delay from `base * (1 ± jitter)`, clamped to `[min, max]`.
    ///
    /// Sessions created together rotate at different times.
    pub fn rotation_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = if self.jitter_fraction > 0.0 {
            rng.gen_range(-self.jitter_fraction..=self.jitter_fraction)
        } else {
            0.0
        };

        let minutes = (self.base_minutes * (1.0 + jitter)).clamp(self.min_minutes, self.max_minutes);
        Duration::from_secs_f64(minutes * 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_delay_within_bounds() {
        let settings = RotationSettings {
            base_minutes: 10.0,
            jitter_fraction: 0.8,
            min_minutes: 4.0,
            max_minutes: 12.0,
        };

        for seed in 0..1000 {
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = settings.rotation_delay(&mut rng);
            assert!(delay >= Duration::from_secs(4 * 60), "seed {}", seed);
            assert!(delay <= Duration::from_secs(12 * 60), "seed {}", seed);
        }
    }

    #[test]
    fn test_delays_are_spread() {
        let settings = RotationSettings::default();
        let mut rng = StdRng::seed_from_u64(7);

        let delays: Vec<Duration> = (0..50).map(|_| settings.rotation_delay(&mut rng)).collect();
        let first = delays[0];

        assert!(delays.iter().any(|d| *d != first));
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let settings = RotationSettings {
            jitter_fraction: 0.0,
            ..RotationSettings::default()
        };

        let delay = settings.rotation_delay(&mut rand::thread_rng());
        assert_eq!(delay, Duration::from_secs(600));
    }
}
