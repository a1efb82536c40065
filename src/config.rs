use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound for the default worker count.
const MIN_DEFAULT_WORKERS: usize = 4;

const DEFAULT_STATE_FLUSH_FREQUENCY: Duration = Duration::from_millis(100);

/// Scheduler settings.
///
/// Zero values mean "use the default", so a config deserialized from a
/// partial document is always usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of workers. `0` picks `max(available parallelism, 4)`.
    pub concurrency: usize,
    /// Keep running independent jobs after a failure.
    pub continue_on_error: bool,
    /// How often a scheduler emitter receives a state snapshot.
    pub state_flush_frequency: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            continue_on_error: false,
            state_flush_frequency: DEFAULT_STATE_FLUSH_FREQUENCY,
        }
    }
}

impl SchedulerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_state_flush_frequency(mut self, frequency: Duration) -> Self {
        self.state_flush_frequency = frequency;
        self
    }

    /// Replaces zero values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = default_concurrency();
        }
        if self.state_flush_frequency.is_zero() {
            self.state_flush_frequency = DEFAULT_STATE_FLUSH_FREQUENCY;
        }
        self
    }
}

/// `max(available parallelism, 4)`.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_DEFAULT_WORKERS)
}
