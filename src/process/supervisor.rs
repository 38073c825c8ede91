//! Parent process that keeps a fixed number of consumer children running
//!
//! Children that exit while the supervisor is live are restarted, subject to
//! a [`RestartBudget`]. On shutdown every child gets SIGTERM, and whatever is
//! still running after the grace period is killed.

use crate::config::ProcessSettings;
use crate::core::shutdown::ShutdownCoordinator;
use crate::process::error::{ProcessError, ProcessResult};
use crate::process::manager::ConsumerProcessManager;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Sliding-window limit on restarts
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`, failing once the window already holds the maximum
    pub fn record(&mut self, now: Instant) -> ProcessResult<()> {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.max_restarts as usize {
            return Err(ProcessError::RestartBudgetExhausted {
                restarts: self.max_restarts,
                window_secs: self.window.as_secs(),
            });
        }
        self.restarts.push_back(now);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Executable started for every child
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workers: usize,
    pub grace_period: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &ProcessSettings, program: PathBuf, args: Vec<String>, workers: usize) -> Self {
        Self {
            program,
            args,
            workers,
            grace_period: Duration::from_secs(settings.grace_period_secs),
            max_restarts: settings.max_restarts,
            restart_window: Duration::from_secs(settings.restart_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub spawned: usize,
    pub restarts: usize,
    /// Children still running after the grace period
    pub killed: usize,
}

struct ChildHandle {
    pid: u32,
    kill: Option<oneshot::Sender<()>>,
}

struct ChildExit {
    slot: usize,
    pid: u32,
    status: std::io::Result<ExitStatus>,
}

impl ChildExit {
    fn describe(&self) -> String {
        match &self.status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        }
    }

    fn is_clean(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    manager: Arc<ConsumerProcessManager>,
    shutdown: ShutdownCoordinator,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, manager: Arc<ConsumerProcessManager>, shutdown: ShutdownCoordinator) -> Self {
        Self {
            config,
            manager,
            shutdown,
        }
    }

    /// Supervise until shutdown or until the restart budget runs out
    pub async fn run(&self) -> ProcessResult<SupervisorReport> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut live: HashMap<usize, ChildHandle> = HashMap::new();
        let mut budget = RestartBudget::new(self.config.max_restarts, self.config.restart_window);
        let mut report = SupervisorReport::default();

        for slot in 0..self.config.workers {
            match self.spawn(slot, &tx) {
                Ok(handle) => {
                    live.insert(slot, handle);
                    report.spawned += 1;
                }
                Err(e) => {
                    let killed = self.terminate(&mut live, &mut rx).await;
                    log::error!(
                        "Could not spawn consumer slot {}: {}; stopped {} already running",
                        slot,
                        e,
                        killed
                    );
                    return Err(e);
                }
            }
        }
        log::info!(
            "Supervising {} consumer processes ({})",
            self.config.workers,
            self.config.program.display()
        );

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                Some(exit) = rx.recv() => {
                    live.remove(&exit.slot);
                    if self.shutdown.is_shutdown_requested() {
                        break;
                    }
                    log::warn!("Consumer pid {} (slot {}) exited: {}", exit.pid, exit.slot, exit.describe());
                    self.record_exit(&exit).await;

                    if let Err(e) = budget.record(Instant::now()) {
                        log::error!("{}; stopping supervision", e);
                        outcome = Err(e);
                        break;
                    }
                    match self.spawn(exit.slot, &tx) {
                        Ok(handle) => {
                            live.insert(exit.slot, handle);
                            report.restarts += 1;
                        }
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
            }
        }

        report.killed = self.terminate(&mut live, &mut rx).await;
        outcome.map(|()| report)
    }

    fn spawn(&self, slot: usize, tx: &mpsc::UnboundedSender<ChildExit>) -> ProcessResult<ChildHandle> {
        let mut child = tokio::process::Command::new(&self.config.program)
            .args(&self.config.args)
            .env("RELAYBUS_WORKER_SLOT", slot.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{}: {}", self.config.program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Spawn("child exited before reporting a pid".to_string()))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let tx = tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = tx.send(ChildExit { slot, pid, status });
        });

        log::debug!("Started consumer pid {} in slot {}", pid, slot);
        Ok(ChildHandle {
            pid,
            kill: Some(kill_tx),
        })
    }

    /// Mark the registry record of a crashed child as failed
    async fn record_exit(&self, exit: &ChildExit) {
        if exit.is_clean() {
            return;
        }
        let views = match self.manager.list().await {
            Ok(views) => views,
            Err(e) => {
                log::warn!("Could not read process registry: {}", e);
                return;
            }
        };
        for view in views {
            let record = view.record;
            if record.pid != exit.pid || record.status.is_terminal() {
                continue;
            }
            let reason = format!("process exited: {}", exit.describe());
            if let Err(e) = self.manager.mark_failed(&record.id, reason).await {
                log::warn!("Could not mark {} failed: {}", record.id, e);
            }
        }
    }

    /// SIGTERM every child, wait out the grace period, then kill the rest
    ///
    /// Returns how many children had to be killed.
    async fn terminate(
        &self,
        live: &mut HashMap<usize, ChildHandle>,
        rx: &mut mpsc::UnboundedReceiver<ChildExit>,
    ) -> usize {
        if live.is_empty() {
            return 0;
        }
        log::info!("Stopping {} consumer processes", live.len());
        for handle in live.values() {
            send_terminate(handle.pid);
        }

        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        while !live.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(exit)) => {
                    live.remove(&exit.slot);
                    self.record_exit(&exit).await;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        if live.is_empty() {
            return 0;
        }

        let killed = live.len();
        log::warn!(
            "{} consumer processes still running after {:?}; killing",
            killed,
            self.config.grace_period
        );
        for handle in live.values_mut() {
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
        }
        while !live.is_empty() {
            match rx.recv().await {
                Some(exit) => {
                    live.remove(&exit.slot);
                    self.record_exit(&exit).await;
                }
                None => break,
            }
        }
        killed
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "SIGTERM to {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    log::debug!("No graceful stop available for {}; waiting for grace period", pid);
}
