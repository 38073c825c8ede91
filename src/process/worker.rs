//! One consumer process from registration to exit

use crate::broker::{BrokerInterface, BrokerResult, LoopControl, LoopObserver, LoopReport, MessageHandler};
use crate::process::manager::{ConsumerProcessManager, HeartbeatStats, ProcessRegistration};
use crate::process::record::ProcessStatus;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sends heartbeats from the consume loop
///
/// Registry failures are logged and swallowed; a consumer keeps consuming
/// when its bookkeeping cannot be written.
struct HeartbeatObserver {
    manager: Arc<ConsumerProcessManager>,
    id: String,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl HeartbeatObserver {
    fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            messages_processed: self.processed.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LoopObserver for HeartbeatObserver {
    async fn on_iteration(&self, report: LoopReport) -> LoopControl {
        self.processed
            .store(report.processed + report.dead_lettered, Ordering::Relaxed);
        self.failed.store(report.failed, Ordering::Relaxed);
        if let Err(e) = self.manager.heartbeat(&self.id, self.stats()).await {
            log::warn!("Heartbeat for {} not recorded: {}", self.id, e);
        }
        LoopControl::Continue
    }
}

/// How a consumer process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerExit {
    pub id: String,
    pub status: ProcessStatus,
    pub stats: HeartbeatStats,
}

pub struct ConsumerProcess {
    broker: Arc<dyn BrokerInterface>,
    manager: Arc<ConsumerProcessManager>,
    handler: Arc<dyn MessageHandler>,
    channels: Vec<String>,
    poll_timeout: Duration,
    batch_size: usize,
}

impl ConsumerProcess {
    pub fn new(
        broker: Arc<dyn BrokerInterface>,
        manager: Arc<ConsumerProcessManager>,
        handler: Arc<dyn MessageHandler>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            broker,
            manager,
            handler,
            channels,
            poll_timeout: Duration::from_millis(1000),
            batch_size: 10,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Register, consume until stopped, and record the outcome
    ///
    /// A clean exit ends `Stopped` and unregisters. A failure ends `Failed`
    /// and leaves the record for listings; the error is returned.
    pub async fn run(&self) -> BrokerResult<ConsumerExit> {
        let record = self
            .manager
            .register(ProcessRegistration {
                driver: self.broker.driver_name().to_string(),
                handler: self.handler.name().to_string(),
                channels: self.channels.clone(),
                pid: None,
            })
            .await?;
        let id = record.id;

        if let Err(e) = self.start(&id).await {
            self.fail(&id, &e.to_string()).await;
            return Err(e);
        }

        let observer = Arc::new(HeartbeatObserver {
            manager: self.manager.clone(),
            id: id.clone(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        self.broker.set_loop_observer(observer.clone());

        let result = self.broker.consume(self.poll_timeout, self.batch_size).await;

        if let Err(e) = self
            .manager
            .update_status(&id, ProcessStatus::Stopping, None)
            .await
        {
            log::warn!("Could not mark {} stopping: {}", id, e);
        }
        if let Err(e) = self.broker.disconnect().await {
            log::warn!("Disconnect of {} failed: {}", id, e);
        }
        let stats = observer.stats();
        if let Err(e) = self.manager.force_heartbeat(&id, stats).await {
            log::warn!("Final heartbeat for {} not recorded: {}", id, e);
        }

        match result {
            Ok(()) => {
                self.manager
                    .update_status(&id, ProcessStatus::Stopped, None)
                    .await?;
                self.manager.unregister(&id).await?;
                log::info!(
                    "Consumer {} stopped after {} messages ({} failed)",
                    id,
                    stats.messages_processed,
                    stats.messages_failed
                );
                Ok(ConsumerExit {
                    id,
                    status: ProcessStatus::Stopped,
                    stats,
                })
            }
            Err(e) => {
                self.fail(&id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn start(&self, id: &str) -> BrokerResult<()> {
        self.broker.connect().await?;
        try_join_all(
            self.channels
                .iter()
                .map(|channel| self.broker.subscribe(channel, self.handler.clone())),
        )
        .await?;
        self.manager
            .update_status(id, ProcessStatus::Running, None)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) {
        if let Err(e) = self.manager.mark_failed(id, reason).await {
            log::warn!("Could not mark {} failed: {}", id, e);
        }
    }
}
