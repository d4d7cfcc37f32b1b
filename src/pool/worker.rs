//! Worker lifecycle: flags the controller polls, and the supervisor thread
//! that drives one worker process.
//!
//! The supervisor is the controller-side half of the worker's task loop. It
//! polls the input queue, ships each task to its process, and routes the
//! reply: results to the output queue, retries and crashes back to the input
//! queue.

use super::config::PoolConfig;
use super::event::Event;
use super::executor::ExecutorHandle;
use super::proc::{KillHandle, Proc, Recv};
use super::protocol::{WorkRequest, WorkResponse};
use super::queue::WaitableQueue;
use super::results::ResultLog;
use super::signals::{TerminationReason, WorkerFailure, analyze_wait_status};
use super::spawn::spawn_named_thread;
use super::task::{Payload, Task};
use crate::error::Result;
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Resolving its executor.
    Init,
    Idle,
    Busy,
    /// Told to finish; waiting for the process to exit.
    Stopping,
    /// Exited on request.
    Terminated,
    /// Executor resolution failed; never ran a task.
    InitFailed,
    /// Died from a task failure or an unexpected signal.
    Crashed,
}

impl WorkerState {
    /// Whether the worker can never run another task.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::InitFailed | Self::Crashed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::InitFailed => "init-failed",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Pool-wide counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub retried: AtomicU64,
    pub crashed_workers: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub forced_terminations: AtomicU64,
}

/// State shared between the controller and every supervisor.
pub(crate) struct Shared<A, R> {
    pub input: Arc<WaitableQueue<Task<A>>>,
    pub output: Arc<WaitableQueue<R>>,
    pub announce: WaitableQueue<ExecutorHandle>,
    /// Tasks dropped by the crash policy or whose result could not be decoded.
    pub failed: ResultLog<Task<A>>,
    pub failures: ResultLog<WorkerFailure>,
    /// Number of supervisors still running.
    pub live: Arc<AtomicUsize>,
    pub counters: Counters,
    pub config: PoolConfig,
}

impl<A, R> Shared<A, R> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            input: Arc::new(WaitableQueue::new()),
            output: Arc::new(WaitableQueue::new()),
            announce: WaitableQueue::new(),
            failed: ResultLog::new(),
            failures: ResultLog::new(),
            live: Arc::new(AtomicUsize::new(0)),
            counters: Counters::default(),
            config,
        }
    }
}

/// Flags a worker reports through.
#[derive(Debug)]
struct WorkerFlags {
    initialized: Event,
    /// Cleared while initializing and while running a task.
    idle: Event,
    stopped: Event,
    alive: AtomicBool,
    state: Mutex<WorkerState>,
}

impl WorkerFlags {
    fn new() -> Self {
        Self {
            initialized: Event::new(false),
            idle: Event::new(false),
            stopped: Event::new(false),
            alive: AtomicBool::new(true),
            state: Mutex::new(WorkerState::Init),
        }
    }

    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Controller's handle to one worker.
pub(crate) struct WorkerHandle {
    id: usize,
    pid: u32,
    flags: Arc<WorkerFlags>,
    kill: KillHandle,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Start supervising a forked worker process.
    pub fn start<A, R>(id: usize, proc: Proc, shared: Arc<Shared<A, R>>) -> Result<Self>
    where
        A: Payload,
        R: Payload,
    {
        let flags = Arc::new(WorkerFlags::new());
        let pid = proc.pid().as_raw() as u32;
        let kill = proc.kill_handle();

        shared.live.fetch_add(1, Ordering::SeqCst);
        let supervisor = Supervisor {
            id,
            proc,
            flags: flags.clone(),
            shared,
        };
        let thread = spawn_named_thread(&format!("procpool-worker-{}", id), move || {
            supervisor.run()
        })?;

        Ok(Self {
            id,
            pid,
            flags,
            kill,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.flags.state()
    }

    pub fn is_alive(&self) -> bool {
        self.flags.alive.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.initialized.is_set()
    }

    /// Alive and either initializing or running a task.
    pub fn is_busy(&self) -> bool {
        self.is_alive() && !self.flags.idle.is_set()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.stopped.is_set()
    }

    /// Let the worker finish what it is doing, then exit.
    pub fn request_stop(&self) {
        self.flags.stopped.set();
    }

    /// Wait until the worker is idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        self.flags.idle.wait(timeout)
    }

    pub fn wait_initialized(&self, timeout: Option<Duration>) -> bool {
        self.flags.initialized.wait(timeout)
    }

    /// Whether the supervisor thread (and so the process) has finished.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Signal the worker process directly. Returns whether it was delivered.
    pub fn signal(&self, sig: Signal) -> bool {
        self.kill.signal(sig)
    }

    /// Wait for the supervisor thread to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(worker_id = self.id, "Worker supervisor thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_stop();
        }
    }
}

/// What happened to a task the supervisor shipped.
enum Outcome {
    Continue,
    Died,
}

/// Controller-side task loop for one worker process.
struct Supervisor<A, R> {
    id: usize,
    proc: Proc,
    flags: Arc<WorkerFlags>,
    shared: Arc<Shared<A, R>>,
}

impl<A, R> Drop for Supervisor<A, R> {
    fn drop(&mut self) {
        self.flags.alive.store(false, Ordering::SeqCst);
        self.flags.idle.set();
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<A, R> Supervisor<A, R>
where
    A: Payload,
    R: Payload,
{
    fn poll_interval(&self) -> Duration {
        self.shared.config.poll_interval
    }

    fn run(mut self) {
        let span = tracing::debug_span!("worker", worker_id = self.id, pid = self.proc.pid().as_raw());
        let _enter = span.enter();

        if !self.initialize() {
            return;
        }

        loop {
            if self.flags.stopped.is_set() {
                self.shutdown();
                return;
            }

            let flags = &self.flags;
            let taken = self.shared.input.get_then(Some(self.poll_interval()), |_| {
                flags.idle.clear();
                flags.set_state(WorkerState::Busy);
            });

            let task = match taken {
                Ok(task) => task,
                Err(_) => {
                    if let Ok(Some(status)) = self.proc.try_wait() {
                        self.died(None, analyze_wait_status(status), "waiting for work", None);
                        return;
                    }
                    continue;
                }
            };

            let outcome = self.execute(task);
            if let Outcome::Died = outcome {
                return;
            }
            self.flags.set_state(WorkerState::Idle);
            self.flags.idle.set();
        }
    }

    /// Wait for the process to resolve its executor.
    fn initialize(&mut self) -> bool {
        loop {
            match self.proc.recv_timeout(self.poll_interval()) {
                Ok(Recv::Message(WorkResponse::Ready { pid })) => {
                    self.shared.announce.put(ExecutorHandle { worker: self.id, pid });
                    self.flags.initialized.set();
                    self.flags.set_state(WorkerState::Idle);
                    self.flags.idle.set();
                    debug!(pid, "Worker initialized");
                    return true;
                }
                Ok(Recv::Message(WorkResponse::InitFailed { message })) => {
                    let reason = self.reap();
                    warn!(reason = %reason, error = %message, "Worker executor failed to initialize");
                    self.record_failure(WorkerState::InitFailed, reason, "initializing", Some(message));
                    return false;
                }
                Ok(Recv::Timeout) => match self.proc.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => {
                        self.init_died(analyze_wait_status(status));
                        return false;
                    }
                    Err(_) => {
                        self.init_died(TerminationReason::Unknown);
                        return false;
                    }
                },
                Ok(Recv::Message(other)) => {
                    warn!(response = ?other, "Unexpected response while initializing");
                    let reason = self.kill();
                    self.init_died(reason);
                    return false;
                }
                Ok(Recv::Closed) | Err(_) => {
                    let reason = self.reap();
                    self.init_died(reason);
                    return false;
                }
            }
        }
    }

    fn init_died(&mut self, reason: TerminationReason) {
        if self.flags.stopped.is_set() {
            debug!(reason = %reason, "Worker terminated before initializing");
            self.flags.set_state(WorkerState::Terminated);
        } else {
            warn!(reason = %reason, "Worker died while initializing");
            self.record_failure(WorkerState::InitFailed, reason, "initializing", None);
        }
    }

    /// Ship one task and wait for its outcome.
    fn execute(&mut self, task: Task<A>) -> Outcome {
        let args = match serde_json::to_value(&task.args) {
            Ok(args) => args,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Task arguments cannot be serialized");
                self.fail_task(task);
                return Outcome::Continue;
            }
        };

        trace!(task_id = task.id, "Dispatching task");
        if let Err(e) = self.proc.send(&WorkRequest::run(task.id, args)) {
            let reason = self.reap();
            self.died(Some(task), reason, "receiving a task", Some(e.to_string()));
            return Outcome::Died;
        }

        loop {
            match self.proc.recv_timeout(self.poll_interval()) {
                Ok(Recv::Timeout) => match self.proc.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => {
                        self.died(Some(task), analyze_wait_status(status), "running a task", None);
                        return Outcome::Died;
                    }
                    Err(_) => {
                        self.died(Some(task), TerminationReason::Unknown, "running a task", None);
                        return Outcome::Died;
                    }
                },
                Ok(Recv::Message(WorkResponse::Done { task: id, value })) if id == task.id => {
                    match serde_json::from_value::<R>(value) {
                        Ok(value) => {
                            self.shared.output.put(value);
                            self.shared.counters.completed.fetch_add(1, Ordering::SeqCst);
                            trace!(task_id = task.id, "Task completed");
                        }
                        Err(e) => {
                            warn!(task_id = task.id, error = %e, "Task result cannot be decoded");
                            self.fail_task(task);
                        }
                    }
                    return Outcome::Continue;
                }
                Ok(Recv::Message(WorkResponse::Retry { task: id })) if id == task.id => {
                    debug!(task_id = task.id, "Task asked to be retried");
                    self.shared.input.put(task);
                    self.shared.counters.retried.fetch_add(1, Ordering::SeqCst);
                    return Outcome::Continue;
                }
                Ok(Recv::Message(WorkResponse::Failed { message, .. })) => {
                    let reason = self.reap();
                    self.died(Some(task), reason, "running a task", Some(message));
                    return Outcome::Died;
                }
                Ok(Recv::Closed) => {
                    let reason = self.reap();
                    self.died(Some(task), reason, "running a task", None);
                    return Outcome::Died;
                }
                Ok(Recv::Message(other)) => {
                    warn!(task_id = task.id, response = ?other, "Unexpected worker response");
                    let reason = self.kill();
                    self.died(Some(task), reason, "running a task", Some("protocol violation".into()));
                    return Outcome::Died;
                }
                Err(e) => {
                    let reason = self.kill();
                    self.died(Some(task), reason, "running a task", Some(e.to_string()));
                    return Outcome::Died;
                }
            }
        }
    }

    /// Handle the worker's death: give the task back, record why.
    fn died(
        &mut self,
        task: Option<Task<A>>,
        reason: TerminationReason,
        context: &str,
        message: Option<String>,
    ) {
        let stopping = self.flags.stopped.is_set();

        if stopping {
            debug!(reason = %reason, "Worker terminated during shutdown");
            self.flags.set_state(WorkerState::Terminated);
        } else {
            warn!(reason = %reason, context, error = message.as_deref(), "Worker died");
            self.shared.counters.crashed_workers.fetch_add(1, Ordering::SeqCst);
            self.record_failure(WorkerState::Crashed, reason, context, message);
        }
        // Dead before its task is visible to the other workers.
        self.flags.alive.store(false, Ordering::SeqCst);

        let Some(mut task) = task else {
            return;
        };
        if stopping {
            // Outcome unknown; it goes back for the aborted list.
            self.shared.input.put(task);
            return;
        }
        task.failures += 1;
        if self.shared.config.allows_resubmit(task.failures) {
            debug!(task_id = task.id, failures = task.failures, "Resubmitting task");
            self.shared.input.put(task);
        } else {
            warn!(
                task_id = task.id,
                failures = task.failures,
                "Task exceeded its crash limit; not resubmitting"
            );
            self.fail_task(task);
        }
    }

    fn record_failure(
        &mut self,
        state: WorkerState,
        reason: TerminationReason,
        context: &str,
        message: Option<String>,
    ) {
        let mut failure = WorkerFailure::new(self.id, reason).with_context(context);
        if let Some(message) = message {
            failure = failure.with_message(message);
        }
        self.shared.failures.push(failure);
        self.flags.set_state(state);
    }

    fn fail_task(&self, task: Task<A>) {
        self.shared.failed.push(task);
        self.shared.counters.failed_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Reap a process that is exiting on its own, killing it if it lingers.
    fn reap(&mut self) -> TerminationReason {
        match self.proc.wait_timeout(self.shared.config.terminate_grace) {
            Ok(Some(status)) => analyze_wait_status(status),
            Ok(None) => self.kill(),
            Err(_) => TerminationReason::Unknown,
        }
    }

    fn kill(&mut self) -> TerminationReason {
        match self.proc.kill() {
            Ok(Some(status)) => analyze_wait_status(status),
            _ => TerminationReason::Unknown,
        }
    }

    /// Graceful exit: ask the process to finish and wait for it, escalating
    /// to signals if it outlives the finish timeout.
    fn shutdown(&mut self) {
        self.flags.set_state(WorkerState::Stopping);
        match self.proc.stop(self.shared.config.finish_timeout) {
            Ok(Some(status)) => {
                let reason = analyze_wait_status(status);
                if !reason.is_clean() {
                    debug!(reason = %reason, "Worker stopped forcibly");
                }
            }
            Ok(None) => warn!("Worker did not exit after SIGKILL"),
            Err(e) => debug!(error = %e, "Worker already reaped"),
        }
        self.flags.set_state(WorkerState::Terminated);
        info!("Worker terminated");
    }
}
