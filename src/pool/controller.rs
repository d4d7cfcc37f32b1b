//! Pool controller: owns the queues, the workers and the result collector.

use super::config::PoolConfig;
use super::executor::{Executor, ExecutorHandle};
use super::results::{ResultLog, Results, Vacuum};
use super::signals::{SignalMask, WorkerFailure};
use super::spawn::spawn_worker;
use super::task::{Payload, Task, TaskId};
use super::worker::{Shared, WorkerHandle, WorkerState};
use crate::error::{PoolError, Result};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of workers the pool was built with.
    pub workers: usize,
    pub live_workers: usize,
    pub busy_workers: usize,
    /// Tasks waiting in the input queue.
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    /// Tasks re-queued at their executor's request.
    pub retried: u64,
    pub crashed_workers: u64,
    /// Tasks moved to the failed log.
    pub failed_tasks: u64,
    /// Workers that had to be signalled during `stop`.
    pub forced_terminations: u64,
}

/// A pool of worker processes, one per executor.
///
/// Tasks go in through [`submit`](Pool::submit); results come out through
/// [`results`](Pool::results) in completion order. A worker whose task fails
/// dies, and the task is resubmitted for the remaining workers.
pub struct Pool<A: Payload, R: Payload> {
    workers: Vec<WorkerHandle>,
    shared: Arc<Shared<A, R>>,
    results: Arc<ResultLog<R>>,
    collector: Option<Vacuum>,
    executors: Option<Vec<ExecutorHandle>>,
    next_task: AtomicU64,
    size: usize,
    stopped: bool,
}

impl<A: Payload, R: Payload> Pool<A, R> {
    /// Start one worker process per executor, with default configuration.
    pub fn new(executors: Vec<Executor<A, R>>) -> Result<Self> {
        Self::with_config(executors, PoolConfig::default())
    }

    /// Start one worker process per executor.
    pub fn with_config(executors: Vec<Executor<A, R>>, config: PoolConfig) -> Result<Self> {
        if executors.is_empty() {
            return Err(PoolError::Construction(
                "A pool needs at least one executor".to_string(),
            ));
        }
        let size = executors.len();
        let shared = Arc::new(Shared::new(config));

        // Fork everything before any supervisor thread exists.
        let mut procs = Vec::with_capacity(size);
        for (id, executor) in executors.into_iter().enumerate() {
            let proc = spawn_worker(id, executor, &procs)?;
            procs.push(proc);
        }

        let mut workers = Vec::with_capacity(size);
        for (id, proc) in procs.into_iter().enumerate() {
            workers.push(WorkerHandle::start(id, proc, shared.clone())?);
        }

        let results = Arc::new(ResultLog::new());
        let collector = Vacuum::spawn(
            "procpool-results",
            shared.output.clone(),
            results.clone(),
            shared.config.poll_interval,
            Some(shared.live.clone()),
        )?;

        info!(workers = size, "Started worker pool");
        Ok(Self {
            workers,
            shared,
            results,
            collector: Some(collector),
            executors: None,
            next_task: AtomicU64::new(0),
            size,
            stopped: false,
        })
    }

    /// Queue a task. Never waits for a worker.
    pub fn submit(&self, args: A) -> TaskId {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        if self.stopped {
            warn!(task_id = id, "Task submitted to a stopped pool, it will be returned by the next stop");
        }
        self.shared.input.put(Task::new(id, args));
        self.shared.counters.submitted.fetch_add(1, Ordering::SeqCst);
        id
    }

    /// Resolved executors, in worker order.
    ///
    /// Blocks until every live worker finished initializing. Workers that
    /// died first are left out.
    pub fn executors(&mut self) -> &[ExecutorHandle] {
        if self.executors.is_none() {
            let poll = self.shared.config.poll_interval;
            for worker in &self.workers {
                while worker.is_alive() && !worker.is_initialized() {
                    worker.wait_initialized(Some(poll));
                }
            }
            let mut handles = self.shared.announce.drain();
            handles.sort_by_key(|h| h.worker);
            self.executors = Some(handles);
        }
        self.executors.as_deref().unwrap_or_default()
    }

    /// Wait for the pool to drain.
    ///
    /// Returns true once the input queue is empty and no worker is busy,
    /// confirmed again after the settle delay. With `keepalive` false, idle
    /// workers beyond `keepalive_spares` are then told to stop.
    ///
    /// Returns false if `block` is false and the pool is not drained, or if
    /// tasks are queued but no worker is left to run them.
    #[instrument(level = "debug", skip(self))]
    pub fn wait(&self, keepalive: bool, keepalive_spares: usize, block: bool) -> bool {
        let input = &self.shared.input;
        let poll = self.shared.config.poll_interval;

        loop {
            if block {
                input.wait_empty(Some(poll));
            }
            let saved = input.put_counter();

            if !input.is_empty() {
                if self.live_workers() == 0 {
                    warn!(queued = input.len(), "No live workers left to run queued tasks");
                    return false;
                }
                if !block {
                    return false;
                }
                continue;
            }

            if let Some(worker) = self.workers.iter().find(|w| w.is_busy()) {
                if !block {
                    return false;
                }
                worker.wait_idle(Some(poll));
                continue;
            }

            if block {
                thread::sleep(self.shared.config.settle_delay);
            }
            if input.put_counter() != saved {
                if !block {
                    return false;
                }
                continue;
            }

            // Results already produced must be visible once this returns.
            let completed = self.shared.counters.completed.load(Ordering::SeqCst) as usize;
            if block {
                self.results.wait_len(completed);
            } else if self.results.len() < completed {
                return false;
            }

            if !keepalive {
                self.shrink(keepalive_spares);
            }
            debug!("Pool drained");
            return true;
        }
    }

    /// Stop idle workers beyond `spares`.
    fn shrink(&self, spares: usize) {
        let mut kept = 0;
        for worker in &self.workers {
            if !worker.is_alive() || worker.is_stop_requested() || !worker.is_initialized() {
                continue;
            }
            if worker.is_busy() {
                continue;
            }
            if kept < spares {
                kept += 1;
                continue;
            }
            debug!(worker_id = worker.id(), "Stopping spare worker");
            worker.request_stop();
        }
    }

    /// Stop every worker and return the tasks that never ran.
    ///
    /// Workers get `finish_timeout` (default from the config) to finish their
    /// current task; stragglers are terminated and their tasks counted as
    /// aborted. SIGINT and SIGTERM are held back on this thread meanwhile.
    /// Calling it again only returns tasks submitted since the first call.
    #[instrument(level = "debug", skip(self))]
    pub fn stop(&mut self, finish_timeout: Option<Duration>) -> Vec<Task<A>> {
        if self.stopped {
            return self.shared.input.drain();
        }
        self.stopped = true;

        let _mask = match SignalMask::interrupts() {
            Ok(mask) => Some(mask),
            Err(e) => {
                warn!(error = %e, "Failed to block interrupts during shutdown");
                None
            }
        };

        for worker in &self.workers {
            worker.request_stop();
        }

        let config = &self.shared.config;
        let aborted = Arc::new(ResultLog::new());
        let mut vacuum = match Vacuum::spawn(
            "procpool-aborted",
            self.shared.input.clone(),
            aborted.clone(),
            config.poll_interval,
            None,
        ) {
            Ok(vacuum) => Some(vacuum),
            Err(e) => {
                warn!(error = %e, "Failed to start the aborted-task collector");
                None
            }
        };

        let deadline = Instant::now() + finish_timeout.unwrap_or(config.finish_timeout);
        while Instant::now() < deadline && self.workers.iter().any(|w| !w.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        self.terminate_stragglers();

        for worker in &mut self.workers {
            worker.join();
        }

        thread::sleep(config.settle_delay);
        if let Some(vacuum) = vacuum.as_mut() {
            vacuum.stop();
        }
        aborted.extend(self.shared.input.drain());
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }
        self.results.close();

        let aborted = aborted.take();
        info!(
            aborted = aborted.len(),
            completed = self.shared.counters.completed.load(Ordering::SeqCst),
            "Stopped worker pool"
        );
        aborted
    }

    /// SIGTERM every worker still running, then SIGKILL whatever survives
    /// the grace period.
    fn terminate_stragglers(&self) {
        let stragglers: Vec<&WorkerHandle> =
            self.workers.iter().filter(|w| !w.is_finished()).collect();
        if stragglers.is_empty() {
            return;
        }
        warn!(
            count = stragglers.len(),
            "Workers did not finish in time, terminating"
        );

        for worker in &stragglers {
            if worker.signal(Signal::SIGTERM) {
                self.shared
                    .counters
                    .forced_terminations
                    .fetch_add(1, Ordering::SeqCst);
            }
        }

        let deadline = Instant::now() + self.shared.config.terminate_grace;
        while Instant::now() < deadline && stragglers.iter().any(|w| !w.is_finished()) {
            thread::sleep(Duration::from_millis(5));
        }
        for worker in stragglers.iter().filter(|w| !w.is_finished()) {
            debug!(worker_id = worker.id(), pid = worker.pid(), "Killing worker");
            worker.signal(Signal::SIGKILL);
        }
    }

    /// Tasks dropped by the crash policy, or whose result could not be decoded.
    pub fn failed(&self) -> Vec<Task<A>>
    where
        A: Clone,
    {
        self.shared.failed.snapshot()
    }

    /// Number of workers the pool was built with.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// State of every worker, in worker order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state()).collect()
    }

    /// Records of workers that died without being asked to.
    pub fn failures(&self) -> Vec<WorkerFailure> {
        self.shared.failures.snapshot()
    }

    /// Whether `stop` has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            workers: self.size,
            live_workers: self.live_workers(),
            busy_workers: self.busy_workers(),
            queued: self.shared.input.len(),
            submitted: counters.submitted.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            retried: counters.retried.load(Ordering::SeqCst),
            crashed_workers: counters.crashed_workers.load(Ordering::SeqCst),
            failed_tasks: counters.failed_tasks.load(Ordering::SeqCst),
            forced_terminations: counters.forced_terminations.load(Ordering::SeqCst),
        }
    }
}

impl<A: Payload, R: Payload + Clone> Pool<A, R> {
    /// Results collected so far, in completion order.
    ///
    /// Iterating blocks for further results until every worker is gone or
    /// the pool is stopped.
    pub fn results(&self) -> Results<R> {
        Results::new(self.results.clone())
    }
}

impl<A: Payload, R: Payload> Drop for Pool<A, R> {
    fn drop(&mut self) {
        let aborted = self.stop(None);
        if !aborted.is_empty() {
            warn!(aborted = aborted.len(), "Pool dropped with unfinished tasks");
        }
    }
}
