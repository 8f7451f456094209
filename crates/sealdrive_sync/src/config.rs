//! Configuration for the synchronization engine.

use rand::Rng;
use sealdrive_core::DEFAULT_BLOCK_SIZE;
use std::time::Duration;

/// Tuning of the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry configuration for an unavailable remote.
    pub retry: RetryConfig,
    /// How many times one entry may go back to pulling after losing an
    /// append race before the sync gives up for now.
    pub max_merge_rounds: u32,
    /// Maximum number of entries synchronized concurrently.
    pub max_concurrent_syncs: usize,
    /// Interval of the background full sync, if any.
    pub sync_interval: Option<Duration>,
    /// Block size used to chunk new file content.
    pub block_size: u64,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_merge_rounds: 8,
            max_concurrent_syncs: 8,
            sync_interval: None,
            block_size: DEFAULT_BLOCK_SIZE,
            event_capacity: 256,
        }
    }

    /// Sets the backoff for remote calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of merge rounds per sync.
    pub fn with_max_merge_rounds(mut self, rounds: u32) -> Self {
        self.max_merge_rounds = rounds;
        self
    }

    /// Sets the concurrency cap.
    pub fn with_max_concurrent_syncs(mut self, limit: usize) -> Self {
        self.max_concurrent_syncs = limit.max(1);
        self
    }

    /// Sets the interval for background full syncs.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the block size for new file content.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff applied while the remote is unavailable.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Adds up to a quarter of the wait at random.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, never waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the first wait.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps each wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
