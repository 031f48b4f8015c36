//! Configuration options which can alter the behavior of a watcher.

use crate::backoff::BackoffConfig;

use std::time::Duration;

/// How quickly an unchanged answer may come back before the watcher treats
/// the backend as misbehaving.
pub const DEFAULT_FAST_RESPONSE_THRESHOLD: Duration = Duration::from_millis(50);

/// How long to pause after such an answer.
pub const DEFAULT_FAST_RESPONSE_DELAY: Duration = Duration::from_millis(50);

/// Policy which is applicable to a resolution watcher.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Delays between retries of failed queries.
    pub backoff: BackoffConfig,

    /// Blocking queries normally take a while. If an answer arrives in less
    /// than this, with unchanged data and an unchanged continuation token,
    /// the watcher pauses for [Self::fast_response_delay] before querying
    /// again.
    ///
    /// Default: 50 milliseconds
    pub fast_response_threshold: Duration,

    /// Default: 50 milliseconds
    pub fast_response_delay: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            fast_response_threshold: DEFAULT_FAST_RESPONSE_THRESHOLD,
            fast_response_delay: DEFAULT_FAST_RESPONSE_DELAY,
        }
    }
}
