use chrono::Duration;

use super::error::{EngineError, Result};
use super::model::{AiFollower, DelayRange, Responsiveness};
use super::random::RandomSource;

/// Default reply window for a responsiveness class, in minutes.
pub fn default_range(class: Responsiveness) -> DelayRange {
    match class {
        Responsiveness::Instant => DelayRange::new(0, 5),
        Responsiveness::Active => DelayRange::new(5, 60),
        Responsiveness::Casual => DelayRange::new(60, 480),
        Responsiveness::Zen => DelayRange::new(480, 1440),
    }
}

/// Range that applies to `follower`: the explicit override if present, else the class default.
pub fn effective_range(follower: &AiFollower) -> Result<DelayRange> {
    let range = follower
        .response_delay
        .unwrap_or_else(|| default_range(follower.responsiveness));

    if range.min > range.max {
        return Err(EngineError::InvalidConfiguration(format!(
            "follower {} has responseDelay min {} greater than max {}",
            follower.id, range.min, range.max
        )));
    }
    Ok(range)
}

/// Reject follower settings that could never schedule correctly.
pub fn validate_follower(follower: &AiFollower) -> Result<()> {
    effective_range(follower)?;
    if follower.response_chance > 100 {
        return Err(EngineError::InvalidConfiguration(format!(
            "follower {} has responseChance {} outside 0..=100",
            follower.id, follower.response_chance
        )));
    }
    Ok(())
}

/// Draw a fresh delay for `follower`. Never cached: every call re-draws.
pub fn compute_delay(follower: &AiFollower, rng: &dyn RandomSource) -> Result<Duration> {
    let range = effective_range(follower)?;
    let minutes = rng.minutes_between(range.min, range.max);
    Ok(Duration::minutes(i64::from(minutes)))
}
