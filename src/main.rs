//! procpool - worker pool demonstrations

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use procpool::logging::{self, LogConfig};
use procpool::{Executor, InitError, Pool, PoolConfig, PoolError, TaskError};
use tracing::Level;

use cli::{Cli, Commands, DeferredArgs, IdentityArgs, SleepArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Identity(args) => cmd_identity(args),
        Commands::Sleep(args) => cmd_sleep(&cli, args),
        Commands::Deferred(args) => cmd_deferred(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Configure tracing from the global flags; `-v`/`-q` win over environment.
fn init_logging(cli: &Cli) {
    let mut config = LogConfig::new()
        .with_ansi(!cli.no_color)
        .with_thread_names(cli.verbose > 1);

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => Some(Level::ERROR),
        (false, 0) => None,
        (false, 1) => Some(Level::INFO),
        (false, 2) => Some(Level::DEBUG),
        (false, _) => Some(Level::TRACE),
    };
    if let Some(level) = level {
        config = config
            .with_level(level)
            .with_filter(level.to_string().to_lowercase());
    }

    config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config);
}

fn pool_config() -> PoolConfig {
    PoolConfig::default().with_env_overrides()
}

/// Submit each value to identity workers and print the results.
fn cmd_identity(args: &IdentityArgs) -> Result<()> {
    let executors = (0..args.workers)
        .map(|_| Executor::direct(|x: i64| Ok(x)))
        .collect();
    let mut pool: Pool<i64, i64> =
        Pool::with_config(executors, pool_config()).context("Failed to start worker pool")?;

    for &value in &args.values {
        pool.submit(value);
    }
    let drained = pool.wait(true, 0, true);
    let aborted = pool.stop(None);

    for value in pool.results() {
        println!("{}", value);
    }

    if !drained || !aborted.is_empty() {
        bail!("{} task(s) never ran", aborted.len());
    }
    Ok(())
}

/// Queue sleeping tasks until they finish or Ctrl-C is pressed.
fn cmd_sleep(cli: &Cli, args: &SleepArgs) -> Result<()> {
    let nap = cli::seconds(args.seconds).context("--seconds must be a non-negative number")?;
    let finish_timeout = match args.finish_timeout {
        Some(value) => {
            Some(cli::seconds(value).context("--finish-timeout must be a non-negative number")?)
        }
        None => None,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupted.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    let executors = (0..args.workers)
        .map(|_| {
            Executor::direct(move |millis: u64| {
                thread::sleep(Duration::from_millis(millis));
                Ok(millis)
            })
        })
        .collect();
    let mut pool: Pool<u64, u64> =
        Pool::with_config(executors, pool_config()).context("Failed to start worker pool")?;
    if !cli.quiet {
        eprintln!("Started {} workers", pool.size());
    }

    let millis = nap.as_millis() as u64;
    for _ in 0..args.tasks {
        pool.submit(millis);
    }
    if !cli.quiet {
        eprintln!("Queued {} tasks. Ctrl-C to abort!", args.tasks);
    }

    let poll = Duration::from_millis(100);
    while !interrupted.load(Ordering::SeqCst) {
        if pool.wait(true, 0, false) || pool.live_workers() == 0 {
            break;
        }
        thread::sleep(poll);
    }
    if interrupted.load(Ordering::SeqCst) && !cli.quiet {
        eprintln!("Interrupted, stopping workers");
    }

    let aborted = pool.stop(finish_timeout);
    let completed = pool.results().len();
    println!("completed: {}", completed);
    println!("aborted: {}", aborted.len());
    println!("total: {}", completed + aborted.len());
    Ok(())
}

/// Resolve executors inside the workers, print where they live, echo tasks.
fn cmd_deferred(args: &DeferredArgs) -> Result<()> {
    let executors = (0..usize::from(args.workers))
        .map(|worker| {
            let fail = args.fail_worker == Some(worker);
            Executor::deferred(move || {
                if fail {
                    return Err(InitError::new(format!("executor {} refused to start", worker)));
                }
                let pid = std::process::id();
                Ok(move |x: i64| -> Result<(usize, u32, i64), TaskError> { Ok((worker, pid, x)) })
            })
        })
        .collect();
    let mut pool: Pool<i64, (usize, u32, i64)> =
        Pool::with_config(executors, pool_config()).context("Failed to start worker pool")?;

    let handles = pool.executors().to_vec();
    println!("executors: {}", handles.len());
    for handle in &handles {
        println!("worker {} pid {}", handle.worker, handle.pid);
    }
    for failure in pool.failures() {
        let error = PoolError::from(failure);
        eprintln!(
            "{}: {}",
            "warning".if_supports_color(Stderr, |text| text.yellow()),
            error
        );
    }
    if handles.is_empty() {
        bail!("No executor could be initialized");
    }

    for x in 0..args.workers as i64 {
        pool.submit(x);
    }
    pool.wait(true, 0, true);
    pool.stop(None);

    for (worker, pid, x) in pool.results() {
        println!("worker {} pid {} echoed {}", worker, pid, x);
    }
    Ok(())
}
