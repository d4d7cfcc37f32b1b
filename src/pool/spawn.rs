//! Worker process and supervisor thread spawning.
//!
//! Workers are created with `fork()` so the executor, including whatever a
//! deferred factory captured, is inherited by the child without being
//! serialized. The child only touches its own pipes and the executor, and
//! leaves with `_exit`.
//!
//! A forked child starts with copies of every descriptor the controller holds,
//! including the pipe ends of workers forked before it. The child closes the
//! ones belonging to its siblings so each worker sees EOF as soon as the
//! controller's own end goes away. Descriptors owned by other pools in the same
//! process are not tracked and stay open in the child.
//!
//! Controller-side threads start with SIGINT and SIGTERM blocked, leaving the
//! thread that owns the pool as the only one that can take them.

use super::child::worker_main;
use super::executor::Executor;
use super::ipc::{LineReader, LineWriter, pipe};
use super::proc::Proc;
use super::signals::SignalMask;
use super::task::Payload;
use crate::error::{PoolError, Result};
use nix::unistd::{ForkResult, fork};

/// Fork a worker process bound to `executor`.
///
/// `siblings` are the workers already forked by this pool; their pipe ends
/// are closed in the child. The parent gets a `Proc` connected to the child's
/// request and response pipes. The child never returns from this function.
pub fn spawn_worker<A, R>(id: usize, executor: Executor<A, R>, siblings: &[Proc]) -> Result<Proc>
where
    A: Payload,
    R: Payload,
{
    let (req_read, req_write) = pipe()
        .map_err(|e| PoolError::Construction(format!("Failed to create pipe for worker {}: {}", id, e)))?;
    let (resp_read, resp_write) = pipe()
        .map_err(|e| PoolError::Construction(format!("Failed to create pipe for worker {}: {}", id, e)))?;

    // Safety: the child only runs the executor and pipe I/O before `_exit`;
    // it never returns into code that expects the parent's threads.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(req_write);
            drop(resp_read);
            for fd in siblings.iter().flat_map(Proc::channel_fds) {
                // Safety: the sibling `Proc` copies are never dropped in the
                // child, so these descriptors are closed exactly once.
                unsafe { libc::close(fd) };
            }
            worker_main(executor, LineReader::new(req_read), LineWriter::new(resp_write))
        }
        Ok(ForkResult::Parent { child }) => {
            drop(req_read);
            drop(resp_write);
            tracing::debug!(worker_id = id, pid = child.as_raw(), "Forked worker process");
            Ok(Proc::new(child, req_write, resp_read))
        }
        Err(e) => Err(PoolError::Construction(format!(
            "Failed to fork worker {}: {}",
            id, e
        ))),
    }
}

/// Spawn a named controller-side thread with SIGINT and SIGTERM blocked.
///
/// The new thread inherits the mask held here; the caller's own mask is
/// restored before returning.
pub fn spawn_named_thread<F, T>(name: &str, f: F) -> Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let _mask = SignalMask::interrupts()?;
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(PoolError::Io)
}
