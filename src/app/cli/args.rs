//! Command line arguments
//!
//! Global flags apply to every subcommand and may appear before or after it.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "relaybus")]
#[command(about = "Message broker consumer runner and process administration")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", global = true, value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", global = true, value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Log file path (use 'none' to log to stderr)
    #[arg(short = 'f', long = "log-file", value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Color output control: --color forces, --color=false disables, unset follows the terminal
    #[arg(short = 'g', long = "color", value_name = "BOOL", global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub color: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one consumer process in the foreground
    Consume(ConsumeArgs),

    /// Run and restart several consumer processes
    Supervise(SuperviseArgs),

    /// List registered consumer processes
    Processes(ProcessesArgs),

    /// Show aggregate process statistics
    Stats(OutputArgs),

    /// Remove process records with stale heartbeats
    Reap(ReapArgs),

    /// Check the configured broker
    Health(OutputArgs),

    /// Publish one message
    Publish(PublishArgs),
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct ConsumeArgs {
    /// Handler name recorded in the process registry
    #[arg(long = "handler", value_name = "NAME", default_value = "log")]
    pub handler: String,

    /// Channel or wildcard pattern to consume (repeatable)
    #[arg(long = "channel", value_name = "CHANNEL", required = true, action = clap::ArgAction::Append)]
    pub channels: Vec<String>,

    /// Maximum wait for one poll, in milliseconds
    #[arg(long = "poll-ms", value_name = "MS", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Messages fetched per poll
    #[arg(long = "batch", value_name = "N", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub batch: u64,
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct SuperviseArgs {
    /// Number of consumer processes
    #[arg(long = "workers", value_name = "N", default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: u64,

    #[command(flatten)]
    pub consume: ConsumeArgs,
}

#[derive(ClapArgs, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputArgs {
    /// Print JSON instead of a table
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct ProcessesArgs {
    #[command(flatten)]
    pub output: OutputArgs,

    /// Only show processes with this status (e.g. running, dead?)
    #[arg(long = "status", value_name = "STATUS")]
    pub status: Option<String>,
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct ReapArgs {
    /// Heartbeat age after which a record is removed (defaults to the configured value)
    #[arg(long = "timeout-secs", value_name = "SECS")]
    pub timeout_secs: Option<u64>,
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct PublishArgs {
    #[arg(long = "channel", value_name = "CHANNEL")]
    pub channel: String,

    #[arg(long = "event", value_name = "EVENT")]
    pub event: String,

    /// JSON payload
    #[arg(long = "data", value_name = "JSON", default_value = "{}", value_parser = parse_json)]
    pub data: serde_json::Value,
}

fn parse_json(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("invalid JSON: {}", e))
}

impl ConsumeArgs {
    /// Arguments that reproduce this command for a child process
    pub fn to_child_args(&self) -> Vec<String> {
        let mut args = vec![
            "consume".to_string(),
            "--handler".to_string(),
            self.handler.clone(),
            "--poll-ms".to_string(),
            self.poll_ms.to_string(),
            "--batch".to_string(),
            self.batch.to_string(),
        ];
        for channel in &self.channels {
            args.push("--channel".to_string());
            args.push(channel.clone());
        }
        args
    }
}

impl Args {
    /// Global flags to pass on to child processes
    pub fn global_child_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_file {
            args.push("--config-file".to_string());
            args.push(path.display().to_string());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        if let Some(format) = &self.log_format {
            args.push("--log-format".to_string());
            args.push(format.clone());
        }
        if let Some(file) = &self.log_file {
            args.push("--log-file".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    /// Resolve the color flag against the terminal
    pub fn use_color(&self) -> bool {
        use std::io::IsTerminal;
        self.color
            .unwrap_or_else(|| std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none())
    }

    /// Log file, treating `none` as stderr
    pub fn log_file(&self) -> Option<String> {
        self.log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .filter(|p| !p.eq_ignore_ascii_case("none"))
    }
}
