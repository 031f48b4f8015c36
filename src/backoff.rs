//! Table-driven retry delays with randomized jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Describes how long to wait between consecutive failed queries.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BackoffConfig {
    /// Base delays, shortest first.
    ///
    /// The first failure waits roughly `intervals[0]`, the second
    /// `intervals[1]`, and so on. Sustained failures saturate at the last
    /// entry. An empty table means "retry immediately".
    pub intervals: Vec<Duration>,

    /// Upper bound of the random perturbation applied to a base delay, as a
    /// percentage of that delay. Values above 100 are treated as 100.
    ///
    /// Default: 10
    pub jitter_percent: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            intervals: vec![
                Duration::from_millis(10),
                Duration::from_millis(50),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(4),
                Duration::from_secs(5),
            ],
            jitter_percent: 10,
        }
    }
}

/// Maps a retry counter onto a delay.
///
/// Each instance owns its random source; callers need exclusive access to
/// compute a delay.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Creates a calculator drawing jitter from a caller-provided generator.
    pub fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self { config, rng }
    }

    /// Returns the delay to wait before attempt `retry + 1`.
    ///
    /// `retry` beyond the end of the table selects the last entry. The result
    /// lies within `[base * (1 - jitter), base * (1 + jitter)]` of the
    /// selected entry.
    pub fn delay(&mut self, retry: usize) -> Duration {
        let intervals = &self.config.intervals;
        let Some(base) = intervals.get(retry).or_else(|| intervals.last()).copied() else {
            return Duration::ZERO;
        };

        let jitter_percent = u64::from(self.config.jitter_percent.min(100));
        if jitter_percent == 0 {
            return base;
        }

        let base_nanos = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
        let max_jitter = (base_nanos / 100).saturating_mul(jitter_percent);
        let jitter = Duration::from_nanos(self.rng.random_range(0..=max_jitter));

        if self.rng.random_bool(0.5) {
            base.saturating_add(jitter)
        } else {
            base.saturating_sub(jitter)
        }
    }
}
