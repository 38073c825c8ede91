//! Subcommand implementations

use crate::app::cli::args::{Args, Command, ConsumeArgs, OutputArgs, ProcessesArgs, PublishArgs, ReapArgs, SuperviseArgs};
use crate::app::cli::display;
use crate::broker::{handler_fn, BrokerContext, BrokerError, BrokerFactory, HealthStatus, Message, MessageHandler};
use crate::config::{BrokerConfig, ConfigError};
use crate::core::error_handling::ContextualError;
use crate::core::shutdown::ShutdownCoordinator;
use crate::process::{ConsumerProcess, ConsumerProcessManager, ProcessError, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Cannot locate the relaybus executable: {0}")]
    Executable(#[source] std::io::Error),

    #[error("Cannot encode output: {0}")]
    Output(#[from] serde_json::Error),
}

impl ContextualError for CommandError {
    fn is_user_actionable(&self) -> bool {
        match self {
            CommandError::Config(e) => e.is_user_actionable(),
            CommandError::Broker(e) => e.is_user_actionable(),
            CommandError::Process(e) => e.is_user_actionable(),
            _ => false,
        }
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            CommandError::Config(e) => e.user_message(),
            CommandError::Broker(e) => e.user_message(),
            CommandError::Process(e) => e.user_message(),
            _ => None,
        }
    }
}

/// Process exit code on success
pub type CommandResult = Result<i32, CommandError>;

/// Environment variable naming a configuration file when `--config-file` is absent
pub const CONFIG_ENV: &str = "RELAYBUS_CONFIG";

/// Configuration from `--config-file`, `RELAYBUS_CONFIG`, the default location,
/// or built-in defaults
pub fn load_config(args: &Args) -> Result<BrokerConfig, ConfigError> {
    if let Some(path) = args.config_file.as_deref() {
        return BrokerConfig::load(path);
    }
    match std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        Some(path) => BrokerConfig::load(std::path::Path::new(&path)),
        None => match BrokerConfig::default_path() {
            Some(path) => BrokerConfig::load(&path),
            None => {
                log::debug!("No configuration file; using defaults");
                Ok(BrokerConfig::default())
            }
        },
    }
}

pub async fn run(args: &Args, config: &BrokerConfig, shutdown: ShutdownCoordinator) -> CommandResult {
    let use_color = args.use_color();
    match &args.command {
        Command::Consume(consume_args) => consume(config, consume_args, shutdown).await,
        Command::Supervise(supervise_args) => supervise(args, config, supervise_args, shutdown).await,
        Command::Processes(list_args) => processes(config, list_args, use_color).await,
        Command::Stats(output) => stats(config, output, use_color).await,
        Command::Reap(reap_args) => reap(config, reap_args).await,
        Command::Health(output) => health(config, output, shutdown, use_color).await,
        Command::Publish(publish_args) => publish(config, publish_args, shutdown).await,
    }
}

/// Handler used by `consume`: logs every message
fn logging_handler(name: &str) -> Arc<dyn MessageHandler> {
    handler_fn(name.to_string(), |message: Message| async move {
        log::info!(
            "{} {} {} {}",
            message.channel(),
            message.event(),
            message.id(),
            message.data()
        );
        Ok(())
    })
}

async fn consume(config: &BrokerConfig, args: &ConsumeArgs, shutdown: ShutdownCoordinator) -> CommandResult {
    let context = BrokerContext::new(shutdown);
    let broker = BrokerFactory::create(config, &context)?;
    let manager = Arc::new(ConsumerProcessManager::from_settings(&config.process));

    let exit = ConsumerProcess::new(broker, manager, logging_handler(&args.handler), args.channels.clone())
        .with_poll_timeout(Duration::from_millis(args.poll_ms))
        .with_batch_size(args.batch as usize)
        .run()
        .await?;
    log::info!("Consumer {} finished: {}", exit.id, exit.status);
    Ok(0)
}

async fn supervise(
    args: &Args,
    config: &BrokerConfig,
    supervise_args: &SuperviseArgs,
    shutdown: ShutdownCoordinator,
) -> CommandResult {
    let program = std::env::current_exe().map_err(CommandError::Executable)?;
    let mut child_args = args.global_child_args();
    child_args.extend(supervise_args.consume.to_child_args());

    let supervisor_config = SupervisorConfig::from_settings(
        &config.process,
        program,
        child_args,
        supervise_args.workers as usize,
    );
    let manager = Arc::new(ConsumerProcessManager::from_settings(&config.process));
    let report = Supervisor::new(supervisor_config, manager, shutdown).run().await?;
    log::info!(
        "Supervisor stopped: {} started, {} restarts, {} killed",
        report.spawned,
        report.restarts,
        report.killed
    );
    Ok(0)
}

async fn processes(config: &BrokerConfig, args: &ProcessesArgs, use_color: bool) -> CommandResult {
    let manager = ConsumerProcessManager::from_settings(&config.process);
    let mut views = manager.list().await?;
    if let Some(status) = &args.status {
        views.retain(|v| &v.display_status == status);
    }

    if args.output.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else if views.is_empty() {
        eprintln!("No consumer processes registered.");
    } else {
        let table = display::process_table(&views, use_color);
        if use_color {
            let _ = table.print_tty(true);
        } else {
            print!("{}", table);
        }
    }
    Ok(0)
}

async fn stats(config: &BrokerConfig, output: &OutputArgs, use_color: bool) -> CommandResult {
    let manager = ConsumerProcessManager::from_settings(&config.process);
    let statistics = manager.statistics().await?;
    if output.json {
        println!("{}", serde_json::to_string_pretty(&statistics)?);
    } else {
        for line in display::statistics_lines(&statistics, use_color) {
            println!("{}", line);
        }
    }
    Ok(0)
}

async fn reap(config: &BrokerConfig, args: &ReapArgs) -> CommandResult {
    let manager = ConsumerProcessManager::from_settings(&config.process);
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.process.reap_timeout_secs));
    let reaped = manager.reap_stale(timeout).await?;
    for id in &reaped {
        println!("{}", id);
    }
    log::info!("Reaped {} stale process records", reaped.len());
    Ok(0)
}

/// Exit code follows monitoring convention: 0 healthy, 1 degraded, 2 unhealthy
async fn health(
    config: &BrokerConfig,
    output: &OutputArgs,
    shutdown: ShutdownCoordinator,
    use_color: bool,
) -> CommandResult {
    let context = BrokerContext::new(shutdown);
    let broker = BrokerFactory::create(config, &context)?;
    if let Err(e) = broker.connect().await {
        log::warn!("Connect failed: {}", e);
    }
    let result = broker.health_check().await;

    if output.json {
        println!("{}", result.to_json());
    } else {
        for line in display::health_lines(&result, use_color) {
            println!("{}", line);
        }
    }
    if broker.is_connected() {
        if let Err(e) = broker.disconnect().await {
            log::debug!("Disconnect after health check failed: {}", e);
        }
    }
    Ok(match result.status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    })
}

async fn publish(config: &BrokerConfig, args: &PublishArgs, shutdown: ShutdownCoordinator) -> CommandResult {
    let context = BrokerContext::new(shutdown);
    let broker = BrokerFactory::connect(config, &context).await?;
    let message = Message::new(args.channel.clone(), args.event.clone(), args.data.clone());
    let id = message.id().to_string();
    broker.publish(&args.channel, message).await?;
    broker.disconnect().await?;
    println!("{}", id);
    Ok(0)
}
