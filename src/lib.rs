//! procpool - a multi-process worker pool.
//!
//! A [`Pool`] forks one long-lived worker process per [`Executor`]. Tasks are
//! submitted without waiting, run by whichever worker is free, and their
//! results are collected in completion order. A task that fails takes its
//! worker down with it and is handed to the surviving workers.
//!
//! ```no_run
//! use procpool::{Executor, Pool};
//!
//! let executors = (0..4).map(|_| Executor::direct(|x: u64| Ok(x * x))).collect();
//! let mut pool: Pool<u64, u64> = Pool::new(executors)?;
//! for x in 0..100 {
//!     pool.submit(x);
//! }
//! pool.wait(true, 0, true);
//! let aborted = pool.stop(None);
//! assert!(aborted.is_empty());
//! let total: u64 = pool.results().iter().sum();
//! # Ok::<(), procpool::PoolError>(())
//! ```

pub mod error;
pub mod logging;
pub mod pool;

pub use error::{InitError, PoolError, Result, TaskError};
pub use pool::{
    Executor, ExecutorHandle, Pool, PoolConfig, PoolStats, Results, Task, TaskId,
    TerminationReason, WorkerFailure, WorkerState,
};
