//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use procpool::logging::LogFormat;
use std::path::PathBuf;

/// Demonstrations of the procpool worker pool.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, global = true, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run integers through identity workers and print the results.
    Identity(IdentityArgs),

    /// Queue sleeping tasks; Ctrl-C aborts and reports what never ran.
    Sleep(SleepArgs),

    /// Start deferred executors, print their worker PIDs, then echo tasks.
    Deferred(DeferredArgs),
}

/// Arguments for the identity command.
#[derive(Parser, Debug)]
#[command(allow_negative_numbers = true)]
pub struct IdentityArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Values to submit.
    #[arg(required = true)]
    pub values: Vec<i64>,
}

/// Arguments for the sleep command.
#[derive(Parser, Debug)]
pub struct SleepArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Number of tasks to queue.
    #[arg(short = 'n', long, default_value_t = 32)]
    pub tasks: usize,

    /// Seconds each task sleeps.
    #[arg(long, default_value_t = 1.0)]
    pub seconds: f64,

    /// Seconds `stop` waits for running tasks before terminating workers.
    #[arg(long)]
    pub finish_timeout: Option<f64>,
}

/// Arguments for the deferred command.
#[derive(Parser, Debug)]
pub struct DeferredArgs {
    /// Number of worker processes.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Make the executor of this worker fail to initialize.
    #[arg(long)]
    pub fail_worker: Option<usize>,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

/// Parse non-negative fractional seconds.
pub fn seconds(value: f64) -> Option<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(value).ok()
}
