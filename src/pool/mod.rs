//! Multi-process worker pool.
//!
//! Each executor gets its own forked worker process. Tasks are queued in the
//! controller; one supervisor thread per worker takes the next task, ships it
//! over the worker's pipe and routes the reply.
//!
//! # Architecture
//!
//! ```text
//!              submit()                             results()
//!                 │                                     ▲
//!          ┌──────▼──────┐                        ┌─────┴─────┐
//!          │ input queue │◄── retry / crash ──┐   │ ResultLog │
//!          └──────┬──────┘                    │   └─────▲─────┘
//!                 │                           │         │ vacuum
//!     ┌───────────┼───────────┐               │   ┌─────┴──────┐
//!     │           │           │               │   │output queue│
//! ┌───▼────┐  ┌───▼────┐  ┌───▼────┐          │   └─────▲──────┘
//! │ super- │  │ super- │  │ super- │──────────┴─────────┘
//! │ visor 0│  │ visor 1│  │ visor N│   (controller threads)
//! └───┬────┘  └───┬────┘  └───┬────┘
//!     │ pipes     │           │
//! ┌───▼────┐  ┌───▼────┐  ┌───▼────┐
//! │worker 0│  │worker 1│  │worker N│   (forked processes)
//! │executor│  │executor│  │executor│
//! └────────┘  └────────┘  └────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: a crashing task takes down only its worker
//! - **Crash recovery**: the task of a dead worker is resubmitted
//! - **Deferred executors**: per-process state built inside the worker
//! - **Cooperative shutdown**: `stop` drains, then force-terminates stragglers

mod child;
mod config;
mod controller;
mod event;
mod executor;
mod ipc;
mod proc;
mod protocol;
mod queue;
mod results;
mod signals;
mod spawn;
mod task;
mod worker;

pub use config::PoolConfig;
pub use controller::{Pool, PoolStats};
pub use event::Event;
pub use executor::{Executor, ExecutorHandle, TaskFn};
pub use queue::{QueueError, WaitableQueue};
pub use results::{ResultIter, Results};
pub use signals::{SignalMask, TerminationReason, WorkerFailure};
pub use task::{Payload, Task, TaskId};
pub use worker::WorkerState;
