//! Time provider abstraction for testable time-dependent logic

use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Abstraction over system time for testable time-dependent logic
pub trait TimeProvider: Send + Sync {
    /// Get the current monotonic time (for measuring intervals)
    fn now(&self) -> Instant;

    /// Get the current system time (for timestamps)
    fn system_time(&self) -> SystemTime;
}

/// Production time provider using actual system time
#[derive(Default, Clone, Debug)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Shared handle to the production clock
pub fn system_clock() -> Arc<dyn TimeProvider> {
    Arc::new(SystemTimeProvider)
}

/// Milliseconds since the unix epoch for a system time (0 before the epoch)
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Manually advanced clock for deterministic tests
#[derive(Clone, Debug)]
pub struct MockTimeProvider {
    current_instant: Arc<Mutex<Instant>>,
    current_system_time: Arc<Mutex<SystemTime>>,
}

impl Default for MockTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTimeProvider {
    /// Create a new mock time provider starting at the current time
    pub fn new() -> Self {
        Self {
            current_instant: Arc::new(Mutex::new(Instant::now())),
            current_system_time: Arc::new(Mutex::new(SystemTime::now())),
        }
    }

    /// Advance both monotonic and system time by the given duration
    pub fn advance_time(&self, duration: Duration) {
        if let Ok(mut instant) = self.current_instant.lock() {
            *instant += duration;
        }
        if let Ok(mut system_time) = self.current_system_time.lock() {
            *system_time += duration;
        }
    }

    /// Set the current system time (for timestamps)
    pub fn set_system_time(&self, system_time: SystemTime) {
        if let Ok(mut current) = self.current_system_time.lock() {
            *current = system_time;
        }
    }
}

impl TimeProvider for MockTimeProvider {
    fn now(&self) -> Instant {
        match self.current_instant.lock() {
            Ok(instant) => *instant,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn system_time(&self) -> SystemTime {
        match self.current_system_time.lock() {
            Ok(time) => *time,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_provider() {
        let provider = SystemTimeProvider;

        let instant1 = provider.now();
        let system1 = provider.system_time();

        std::thread::sleep(Duration::from_millis(1));

        let instant2 = provider.now();
        let system2 = provider.system_time();

        assert!(instant2 > instant1);
        assert!(system2 > system1);
    }

    #[test]
    fn test_mock_time_provider() {
        let provider = MockTimeProvider::new();

        let initial_instant = provider.now();
        let initial_system = provider.system_time();

        provider.advance_time(Duration::from_secs(10));

        assert_eq!(
            provider.now().duration_since(initial_instant),
            Duration::from_secs(10)
        );
        assert_eq!(
            provider.system_time().duration_since(initial_system).unwrap(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_epoch_millis() {
        assert_eq!(epoch_millis(UNIX_EPOCH), 0);
        assert_eq!(epoch_millis(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
    }
}
