// src/utils.rs

//! Small helpers shared by the bus, the handlers and the CLI

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timing utilities
pub mod timing {
    use super::*;

    /// Simple stopwatch for measuring execution time
    #[derive(Debug, Clone)]
    pub struct Stopwatch {
        start_time: Instant,
    }

    impl Stopwatch {
        /// Create and start a new stopwatch
        pub fn start() -> Self {
            Self {
                start_time: Instant::now(),
            }
        }

        /// Get elapsed time since start
        pub fn elapsed(&self) -> Duration {
            self.start_time.elapsed()
        }

        /// Stop the stopwatch and return total elapsed time
        pub fn stop(self) -> Duration {
            self.start_time.elapsed()
        }
    }

    /// Convert duration to human-readable string
    pub fn duration_to_human(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let days = total_seconds / 86400;
        let hours = (total_seconds % 86400) / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;
        let millis = duration.subsec_millis();

        if days > 0 {
            format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
        } else if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else if seconds > 0 {
            format!("{}.{:03}s", seconds, millis)
        } else {
            format!("{}ms", millis)
        }
    }
}

/// Retry utilities for handling transient failures
pub mod retry {
    use super::*;

    /// Exponential backoff schedule
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RetryConfig {
        /// Retries after the first attempt
        pub max_retries: u32,
        /// Delay before the first retry
        pub initial_delay: Duration,
        /// Upper bound for any single delay
        pub max_delay: Duration,
        /// Backoff multiplier
        pub backoff_multiplier: f64,
    }

    impl Default for RetryConfig {
        fn default() -> Self {
            Self {
                max_retries: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            }
        }
    }

    impl RetryConfig {
        /// Delay before retry number `retry` (0-based): `initial * multiplier^retry`, capped
        pub fn delay_for(&self, retry: u32) -> Duration {
            let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
            let millis = (self.initial_delay.as_millis() as f64 * factor)
                .min(self.max_delay.as_millis() as f64);
            Duration::from_millis(millis as u64)
        }
    }
}
