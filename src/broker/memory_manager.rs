//! Memory ceiling monitor for long-running consume loops
//!
//! The consume loop calls [`MemoryManager::tick`] once per iteration. Every
//! `check_every` ticks the resident set size is sampled; above the warning
//! ratio the registered [`Cleanup`] hooks run, and above the hard limit the loop
//! is told to stop so a supervisor can restart the process with a clean heap.

use crate::core::cleanup::Cleanup;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Source of the current process's resident memory
pub trait MemorySampler: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Samples this process through `sysinfo`
pub struct SysinfoSampler {
    system: Mutex<sysinfo::System>,
    pid: sysinfo::Pid,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid: sysinfo::Pid::from_u32(std::process::id()),
        }
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(self.pid) {
            return None;
        }
        system.process(self.pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryManagerConfig {
    /// Hard ceiling in bytes; 0 disables the ceiling
    pub limit_bytes: u64,
    /// Fraction of the limit at which cleanup hooks run
    pub warning_ratio: f64,
    /// Sample once every this many ticks
    pub check_every: u64,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 512 * 1024 * 1024,
            warning_ratio: 0.8,
            check_every: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    /// Below the warning threshold, or not sampled this tick
    Ok,
    /// Crossed the warning threshold; cleanup hooks ran
    Warning { used_bytes: u64, limit_bytes: u64 },
    /// Still above the hard limit after cleanup
    LimitExceeded { used_bytes: u64, limit_bytes: u64 },
}

pub struct MemoryManager {
    config: MemoryManagerConfig,
    sampler: Box<dyn MemorySampler>,
    hooks: RwLock<Vec<Arc<dyn Cleanup>>>,
    ticks: AtomicU64,
    last_sample: AtomicU64,
    cleanups: AtomicU64,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .field("last_sample", &self.last_sample.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryManager {
    pub fn new(config: MemoryManagerConfig) -> Self {
        Self::with_sampler(config, Box::new(SysinfoSampler::default()))
    }

    pub fn with_sampler(config: MemoryManagerConfig, sampler: Box<dyn MemorySampler>) -> Self {
        Self {
            config: MemoryManagerConfig {
                check_every: config.check_every.max(1),
                ..config
            },
            sampler,
            hooks: RwLock::new(Vec::new()),
            ticks: AtomicU64::new(0),
            last_sample: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        }
    }

    pub fn register_cleanup(&self, hook: Arc<dyn Cleanup>) {
        if let Ok(mut hooks) = self.hooks.write() {
            log::debug!("Registered memory cleanup hook '{}'", hook.cleanup_name());
            hooks.push(hook);
        }
    }

    /// Count one loop iteration, sampling memory when due
    pub fn tick(&self) -> MemoryStatus {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % self.config.check_every != 0 {
            return MemoryStatus::Ok;
        }
        self.check_now()
    }

    /// Sample immediately, running cleanup hooks if over the warning threshold
    pub fn check_now(&self) -> MemoryStatus {
        if self.config.limit_bytes == 0 {
            return MemoryStatus::Ok;
        }
        let Some(used) = self.sample() else {
            return MemoryStatus::Ok;
        };

        let limit = self.config.limit_bytes;
        let warning = (limit as f64 * self.config.warning_ratio) as u64;
        if used < warning {
            return MemoryStatus::Ok;
        }

        self.run_cleanup();
        let used = self.sample().unwrap_or(used);

        if used >= limit {
            log::warn!(
                "Memory limit exceeded: {} bytes used, limit {} bytes",
                used,
                limit
            );
            MemoryStatus::LimitExceeded {
                used_bytes: used,
                limit_bytes: limit,
            }
        } else {
            log::info!(
                "Memory usage {} bytes above warning threshold {} bytes",
                used,
                warning
            );
            MemoryStatus::Warning {
                used_bytes: used,
                limit_bytes: limit,
            }
        }
    }

    pub fn last_sample_bytes(&self) -> u64 {
        self.last_sample.load(Ordering::Relaxed)
    }

    pub fn cleanup_runs(&self) -> u64 {
        self.cleanups.load(Ordering::Relaxed)
    }

    fn sample(&self) -> Option<u64> {
        let used = self.sampler.resident_bytes()?;
        self.last_sample.store(used, Ordering::Relaxed);
        Some(used)
    }

    fn run_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        let hooks = match self.hooks.read() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };
        for hook in hooks {
            log::debug!("Running memory cleanup hook '{}'", hook.cleanup_name());
            hook.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedSampler {
        values: Mutex<Vec<u64>>,
    }

    impl ScriptedSampler {
        fn new(values: &[u64]) -> Box<Self> {
            let mut values = values.to_vec();
            values.reverse();
            Box::new(Self {
                values: Mutex::new(values),
            })
        }
    }

    impl MemorySampler for ScriptedSampler {
        fn resident_bytes(&self) -> Option<u64> {
            let mut values = self.values.lock().unwrap();
            if values.len() > 1 {
                values.pop()
            } else {
                values.last().copied()
            }
        }
    }

    #[derive(Default)]
    struct CountingCleanup(AtomicUsize);

    impl Cleanup for CountingCleanup {
        fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn cleanup_name(&self) -> &str {
            "counting"
        }
    }

    fn config(limit: u64, every: u64) -> MemoryManagerConfig {
        MemoryManagerConfig {
            limit_bytes: limit,
            warning_ratio: 0.5,
            check_every: every,
        }
    }

    #[test]
    fn test_samples_only_every_n_ticks() {
        let manager = MemoryManager::with_sampler(config(1000, 3), ScriptedSampler::new(&[100]));
        assert_eq!(manager.tick(), MemoryStatus::Ok);
        assert_eq!(manager.tick(), MemoryStatus::Ok);
        assert_eq!(manager.last_sample_bytes(), 0);
        assert_eq!(manager.tick(), MemoryStatus::Ok);
        assert_eq!(manager.last_sample_bytes(), 100);
    }

    #[test]
    fn test_warning_runs_cleanup_hooks() {
        let manager = MemoryManager::with_sampler(config(1000, 1), ScriptedSampler::new(&[600, 550]));
        let hook = Arc::new(CountingCleanup::default());
        manager.register_cleanup(hook.clone());

        assert_eq!(
            manager.tick(),
            MemoryStatus::Warning {
                used_bytes: 550,
                limit_bytes: 1000
            }
        );
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cleanup_runs(), 1);
    }

    #[test]
    fn test_limit_exceeded_after_cleanup() {
        let manager = MemoryManager::with_sampler(config(1000, 1), ScriptedSampler::new(&[1500, 1200]));
        assert_eq!(
            manager.tick(),
            MemoryStatus::LimitExceeded {
                used_bytes: 1200,
                limit_bytes: 1000
            }
        );
    }

    #[test]
    fn test_cleanup_can_recover_below_limit() {
        let manager = MemoryManager::with_sampler(config(1000, 1), ScriptedSampler::new(&[1500, 200]));
        assert_eq!(
            manager.check_now(),
            MemoryStatus::Warning {
                used_bytes: 200,
                limit_bytes: 1000
            }
        );
    }

    #[test]
    fn test_zero_limit_disables_checks() {
        let manager = MemoryManager::with_sampler(config(0, 1), ScriptedSampler::new(&[u64::MAX]));
        assert_eq!(manager.tick(), MemoryStatus::Ok);
    }

    #[test]
    fn test_sysinfo_sampler_reads_own_process() {
        let sampler = SysinfoSampler::default();
        if let Some(bytes) = sampler.resident_bytes() {
            assert!(bytes > 0);
        }
    }
}
