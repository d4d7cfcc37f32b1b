//! Worker process main loop.
//!
//! Runs in the forked child. It resolves the executor, reports readiness,
//! then serves run requests from the controller until told to exit.
//! Nothing here may log or return into the parent's code: the child ends
//! with `_exit`.

use super::executor::{Executor, TaskFn};
use super::ipc::{LineReader, LineWriter};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{EXIT_INIT_FAILED, EXIT_TASK_FAILED};
use super::task::Payload;
use crate::error::TaskError;
use nix::sys::signal::{self, SigHandler, Signal};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};

/// How the serve loop ended.
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    /// Exit request or EOF.
    Finished,
    /// A task failed; the failure was reported.
    TaskFailed,
}

fn send(writer: &mut LineWriter, response: &WorkResponse) -> io::Result<()> {
    let line = response.to_line().map_err(io::Error::other)?;
    writer.write_line(&line)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Run one task through the executor.
fn handle_run<A, R>(
    executor: &mut TaskFn<A, R>,
    task: u64,
    args: serde_json::Value,
) -> WorkResponse
where
    A: Payload,
    R: Payload,
{
    let args: A = match serde_json::from_value(args) {
        Ok(args) => args,
        Err(e) => return WorkResponse::failed(task, format!("Invalid task arguments: {}", e)),
    };

    match panic::catch_unwind(AssertUnwindSafe(|| executor(args))) {
        Ok(Ok(value)) => match serde_json::to_value(value) {
            Ok(value) => WorkResponse::Done { task, value },
            Err(e) => WorkResponse::failed(task, format!("Unserializable result: {}", e)),
        },
        Ok(Err(TaskError::Retry)) => WorkResponse::Retry { task },
        Ok(Err(TaskError::Failed(message))) => WorkResponse::failed(task, message),
        Err(payload) => WorkResponse::failed(task, panic_message(payload.as_ref())),
    }
}

/// Serve requests until exit, EOF or a task failure.
fn worker_loop<A, R>(
    executor: &mut TaskFn<A, R>,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<LoopExit>
where
    A: Payload,
    R: Payload,
{
    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            None => return Ok(LoopExit::Finished), // controller went away
        };

        let request = WorkRequest::from_line(&line).map_err(io::Error::other)?;
        match request {
            WorkRequest::Exit => return Ok(LoopExit::Finished),
            WorkRequest::Run { task, args } => {
                let response = handle_run(executor, task, args);
                let failed = matches!(response, WorkResponse::Failed { .. });
                send(writer, &response)?;
                if failed {
                    return Ok(LoopExit::TaskFailed);
                }
            }
        }
    }
}

/// Resolve the executor and serve; returns the process exit status.
fn run<A, R>(executor: Executor<A, R>, mut reader: LineReader, mut writer: LineWriter) -> i32
where
    A: Payload,
    R: Payload,
{
    let resolved = panic::catch_unwind(AssertUnwindSafe(|| executor.resolve()));
    let mut executor = match resolved {
        Ok(Ok(f)) => f,
        Ok(Err(e)) => {
            let _ = send(&mut writer, &WorkResponse::InitFailed { message: e.0 });
            return EXIT_INIT_FAILED;
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let _ = send(&mut writer, &WorkResponse::InitFailed { message });
            return EXIT_INIT_FAILED;
        }
    };

    let ready = WorkResponse::Ready {
        pid: std::process::id(),
    };
    if send(&mut writer, &ready).is_err() {
        return EXIT_TASK_FAILED;
    }

    match worker_loop(&mut executor, &mut reader, &mut writer) {
        Ok(LoopExit::Finished) => 0,
        Ok(LoopExit::TaskFailed) => EXIT_TASK_FAILED,
        Err(_) => EXIT_TASK_FAILED,
    }
}

/// Entry point of a freshly forked worker. Never returns.
pub(crate) fn worker_main<A, R>(
    executor: Executor<A, R>,
    reader: LineReader,
    writer: LineWriter,
) -> !
where
    A: Payload,
    R: Payload,
{
    // Pipe errors are handled via io::Error; panics are reported over the pipe.
    // Terminal interrupts are the controller's to handle: it decides when
    // workers stop.
    for sig in [Signal::SIGPIPE, Signal::SIGINT] {
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigIgn);
        }
    }
    panic::set_hook(Box::new(|_| {}));

    let code = run(executor, reader, writer);
    // Skip atexit handlers and destructors inherited from the parent.
    unsafe { libc::_exit(code) }
}
