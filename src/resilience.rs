//! Retry and backoff policies for reconnection and resolution.
//!
//! Continuous sessions and service-record resolution both recover from
//! transient failures with exponential backoff. [`RetryConfig`] captures the
//! schedule; callers compute the delay for a given attempt with
//! [`RetryConfig::delay_for_attempt`].

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries (continuous sessions).
    pub max_attempts: usize,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connect_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Infinite retry for continuous replication sessions.
    ///
    /// A continuous session must never require a manual restart for
    /// recoverable errors, so it retries forever with the backoff capped
    /// at one minute. Devices roam in and out of radio range; an hour-long
    /// partition is normal, not fatal.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Reasoning
    /// -------  -----     ---------
    /// 1        1s        Brief radio blip
    /// 2        2s        Wi-Fi roam between access points
    /// 3        4s        Peer device sleeping
    /// 4        8s        Peer left the room
    /// 5        16s       Network partition
    /// 6        32s       Extended partition
    /// 7+       60s       Cap at 1 minute, retry forever
    /// ```
    pub fn session() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Bounded retry for service-record resolution.
    ///
    /// mDNS resolution fails sporadically on congested networks. Retrying a
    /// handful of times with backoff recovers most candidates; after that
    /// the record is dropped and discovery waits for the next found event.
    pub fn resolve() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            connect_timeout: Duration::from_secs(3),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connect_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}
