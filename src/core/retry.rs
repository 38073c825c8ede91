//! Retry utility for handling transient errors in async operations
//!
//! Provides configurable retry policies with exponential backoff. Used by the
//! drivers when establishing backend connections.

use crate::core::shutdown::ShutdownCoordinator;
use std::time::Duration;
use tokio::time::sleep;

/// Configurable retry policy for async operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
            backoff_factor: 2,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = (self.backoff_factor.max(1) as u64).saturating_pow(attempt as u32);
        let millis = (self.delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Execute an async operation with retry logic for transient errors
///
/// # Examples
/// ```rust
/// use relaybus::core::retry::{retry_async, RetryPolicy};
///
/// # async fn example() -> Result<String, String> {
/// let result = retry_async(
///     "backend_connect",
///     RetryPolicy::default(),
///     || async {
///         Ok::<String, String>("connected".to_string())
///     }
/// ).await?;
/// # Ok(result)
/// # }
/// ```
pub async fn retry_async<F, T, E, Fut>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if attempt + 1 >= attempts {
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                log::debug!(
                    "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    attempts,
                    delay,
                    error
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns `false` when the sleep was cut short by shutdown.
pub async fn sleep_unless_shutdown(duration: Duration, shutdown: &ShutdownCoordinator) -> bool {
    if shutdown.is_shutdown_requested() {
        return false;
    }
    let mut rx = shutdown.subscribe();
    tokio::select! {
        _ = sleep(duration) => !shutdown.is_shutdown_requested(),
        _ = rx.recv() => false,
    }
}
