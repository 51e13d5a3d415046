use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// All randomness used by scheduling goes through here.
pub trait RandomSource: Send + Sync {
    /// Bernoulli trial that succeeds with `percent`/100 probability.
    fn chance(&self, percent: u8) -> bool;

    /// Uniform draw from `min..=max`. Callers guarantee `min <= max`.
    fn minutes_between(&self, min: u32, max: u32) -> u32;
}

pub struct StdRandom {
    rng: Mutex<StdRng>,
}

impl StdRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for StdRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for StdRandom {
    fn chance(&self, percent: u8) -> bool {
        match percent {
            0 => false,
            p if p >= 100 => true,
            p => self.rng.lock().gen_range(0..100u8) < p,
        }
    }

    fn minutes_between(&self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        self.rng.lock().gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chance_extremes() {
        let rng = StdRandom::seeded(7);
        for _ in 0..200 {
            assert!(rng.chance(100));
            assert!(!rng.chance(0));
        }
    }

    #[test]
    fn test_seeded_draws_repeat() {
        let a = StdRandom::seeded(42);
        let b = StdRandom::seeded(42);
        let xs: Vec<u32> = (0..20).map(|_| a.minutes_between(0, 1440)).collect();
        let ys: Vec<u32> = (0..20).map(|_| b.minutes_between(0, 1440)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_minutes_between_stays_inclusive() {
        let rng = StdRandom::seeded(1);
        let mut saw_min = false;
        let mut saw_max = false;
        for _ in 0..2000 {
            let v = rng.minutes_between(3, 6);
            assert!((3..=6).contains(&v));
            saw_min |= v == 3;
            saw_max |= v == 6;
        }
        assert!(saw_min && saw_max);
    }
}
