//! PRP runtime: per-subtask blueprint generation, coder execution,
//! progressive validation, commit, with cache and retry.

pub mod blueprint;
pub mod cache;
pub mod checkpoint;
pub mod executor;
pub mod gates;
pub mod generator;
pub mod runner;

pub use blueprint::{Blueprint, ValidationGate};
pub use runner::{PrpRuntime, SubtaskOutcome};

use rand::Rng;
use std::time::Duration;

/// Apply symmetric jitter to a backoff delay.
pub(crate) fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jittered_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base, 0.2);
            assert!(d >= Duration::from_millis(800), "{d:?}");
            assert!(d <= Duration::from_millis(1200), "{d:?}");
        }
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let base = Duration::from_millis(1500);
        assert_eq!(jittered(base, 0.0), base);
    }
}
