//! Crash analysis for worker processes, and signal masking for teardown.

use crate::error::PoolError;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::wait::WaitStatus;

/// Exit status of a worker whose task raised an uncaught failure.
pub const EXIT_TASK_FAILED: i32 = 1;

/// Exit status of a worker whose executor could not be resolved.
pub const EXIT_INIT_FAILED: i32 = 2;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Clean exit after an exit request or EOF.
    Finished,
    /// Exited after a task failure it reported.
    TaskFailed,
    /// Exited because its executor failed to initialize.
    InitFailed,
    /// Exited with some other status code.
    Exited(i32),
    /// Killed by SIGKILL (forced termination or the OOM killer).
    Killed,
    /// Memory fault (SIGSEGV or SIGBUS).
    MemoryFault(Signal),
    /// Killed by another signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Whether the worker went away on its own terms.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Finished => "finished".to_string(),
            Self::TaskFailed => "exited after a task failure".to_string(),
            Self::InitFailed => "executor initialization failed".to_string(),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::MemoryFault(sig) => format!("memory fault ({:?})", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, 0) => TerminationReason::Finished,
        WaitStatus::Exited(_, EXIT_TASK_FAILED) => TerminationReason::TaskFailed,
        WaitStatus::Exited(_, EXIT_INIT_FAILED) => TerminationReason::InitFailed,
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::MemoryFault(signal),
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Record of a worker that died without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    /// Worker index.
    pub worker: usize,
    /// Why the process terminated.
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
    /// Error message reported by the worker, if any.
    pub message: Option<String>,
}

impl WorkerFailure {
    pub fn new(worker: usize, reason: TerminationReason) -> Self {
        Self {
            worker,
            reason,
            context: None,
            message: None,
        }
    }

    /// Add context about what the worker was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add an error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {} {}", self.worker, self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl From<WorkerFailure> for PoolError {
    fn from(failure: WorkerFailure) -> Self {
        match failure.reason {
            TerminationReason::InitFailed => PoolError::InitializationFailed {
                worker: failure.worker,
                message: failure
                    .message
                    .unwrap_or_else(|| failure.reason.to_string()),
            },
            _ => PoolError::WorkerCrashed {
                worker: failure.worker,
                reason: match &failure.message {
                    Some(message) => format!("{}: {}", failure.reason, message),
                    None => failure.reason.to_string(),
                },
            },
        }
    }
}

/// Blocks signals on the current thread until dropped.
///
/// Blocked signals stay pending and are delivered when the previous mask is
/// restored, so an interrupt during teardown is deferred rather than lost.
pub struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    /// Block `signals` on the calling thread.
    pub fn block(signals: &[Signal]) -> nix::Result<Self> {
        let mut set = SigSet::empty();
        for &sig in signals {
            set.add(sig);
        }
        let previous = set.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        Ok(Self { previous })
    }

    /// Block SIGINT and SIGTERM.
    pub fn interrupts() -> nix::Result<Self> {
        Self::block(&[Signal::SIGINT, Signal::SIGTERM])
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Err(e) = self.previous.thread_set_mask() {
            tracing::warn!(error = %e, "Failed to restore signal mask");
        }
    }
}
