//! Process handle for worker processes.
//!
//! Wraps a forked child with its IPC channels.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a bounded wait for a worker message.
#[derive(Debug)]
pub enum Recv {
    Message(WorkResponse),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The worker closed its end of the pipe.
    Closed,
}

/// Shared right to signal a worker process.
///
/// The PID is cleared under the same lock that reaps the child, so a signal
/// can never reach a recycled PID.
#[derive(Debug, Clone)]
pub struct KillHandle {
    pid: Arc<Mutex<Option<Pid>>>,
}

impl KillHandle {
    fn new(pid: Pid) -> Self {
        Self {
            pid: Arc::new(Mutex::new(Some(pid))),
        }
    }

    /// Send `sig` if the process has not been reaped yet.
    /// Returns whether a signal was sent.
    pub fn signal(&self, sig: Signal) -> bool {
        let guard = self.pid.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(pid) => signal::kill(pid, sig).is_ok(),
            None => false,
        }
    }

    /// Whether the process is still unreaped.
    pub fn is_live(&self) -> bool {
        self.pid.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Handle to a worker process with IPC channels.
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Writer for sending requests to the worker
    writer: LineWriter,
    /// Reader for receiving responses from the worker
    reader: LineReader,
    kill: KillHandle,
    /// Exit status once reaped
    status: Option<WaitStatus>,
}

impl Proc {
    /// Create a new process handle from its components.
    ///
    /// # Arguments
    /// * `pid` - The process ID
    /// * `requests` - Write end of the worker's request pipe
    /// * `responses` - Read end of the worker's response pipe
    pub fn new(pid: Pid, requests: PipeFd, responses: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(requests),
            reader: LineReader::new(responses),
            kill: KillHandle::new(pid),
            status: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raw descriptors of the request and response pipe ends held here.
    pub fn channel_fds(&self) -> [RawFd; 2] {
        [
            self.writer.as_fd().as_raw_fd(),
            self.reader.as_fd().as_raw_fd(),
        ]
    }

    /// A handle other threads can use to signal this process.
    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker {}: {}", self.pid, e)))
    }

    /// Wait up to `timeout` for a response.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Recv> {
        if !self.reader.wait_readable(timeout)? {
            return Ok(Recv::Timeout);
        }
        match self.reader.read_line() {
            Ok(Some(line)) => {
                let response = WorkResponse::from_line(line).map_err(|e| {
                    PoolError::Worker(format!("Invalid worker response: {}", e))
                })?;
                Ok(Recv::Message(response))
            }
            Ok(None) => Ok(Recv::Closed),
            Err(e) => Err(PoolError::Worker(format!(
                "Failed to receive from worker {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` while it is still running. Once reaped, keeps
    /// returning the recorded status.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let mut slot = self.kill.pid.lock().unwrap_or_else(|e| e.into_inner());
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                *slot = None;
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => {
                *slot = None;
                Err(PoolError::Worker(format!("waitpid({}) failed: {}", self.pid, e)))
            }
        }
    }

    /// Poll until the process exits or `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) {
        self.kill.signal(Signal::SIGTERM);
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<Option<WaitStatus>> {
        self.kill.signal(Signal::SIGKILL);
        self.wait_timeout(Duration::from_secs(5))
    }

    /// Ask the worker to exit, then wait for it.
    ///
    /// Escalates to SIGTERM and SIGKILL only if it has not exited within
    /// `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let _ = self.send(&WorkRequest::Exit);
        if let Some(status) = self.wait_timeout(timeout)? {
            return Ok(Some(status));
        }

        self.terminate();
        if let Some(status) = self.wait_timeout(Duration::from_millis(100))? {
            return Ok(Some(status));
        }
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() && self.kill.is_live() {
            self.kill.signal(Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            *self.kill.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }
}
