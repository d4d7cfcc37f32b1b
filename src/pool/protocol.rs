//! IPC protocol between the controller and a worker process.
//!
//! Messages are JSON-serialized and newline-delimited. Task arguments and
//! return values travel as `serde_json::Value` so the protocol itself is not
//! generic over the pool's payload types.

use super::task::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Run the executor on one task.
    #[serde(rename = "run")]
    Run {
        /// Task identifier, echoed in the response
        task: TaskId,
        /// Serialized task arguments
        args: Value,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Executor resolved; worker is ready for work.
    #[serde(rename = "ready")]
    Ready {
        /// PID of the worker process
        pid: u32,
    },

    /// Executor resolution failed; the worker exits.
    #[serde(rename = "init_failed")]
    InitFailed { message: String },

    /// Task produced a value.
    #[serde(rename = "done")]
    Done { task: TaskId, value: Value },

    /// Executor asked for the task to be re-queued.
    #[serde(rename = "retry")]
    Retry { task: TaskId },

    /// Uncaught failure; the worker exits after sending this.
    #[serde(rename = "failed")]
    Failed { task: TaskId, message: String },
}

impl WorkRequest {
    /// Create a run request.
    pub fn run(task: TaskId, args: Value) -> Self {
        Self::Run { task, args }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    /// Create a failure response.
    pub fn failed(task: TaskId, message: impl Into<String>) -> Self {
        Self::Failed {
            task,
            message: message.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_request_serialization() {
        let req = WorkRequest::run(9, json!([1, "two"]));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"run\""));

        match WorkRequest::from_line(&line).unwrap() {
            WorkRequest::Run { task, args } => {
                assert_eq!(task, 9);
                assert_eq!(args, json!([1, "two"]));
            }
            other => panic!("Expected Run variant, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_request() {
        let line = WorkRequest::Exit.to_line().unwrap();
        assert_eq!(line, "{\"type\":\"exit\"}\n");
        assert!(matches!(
            WorkRequest::from_line(&line).unwrap(),
            WorkRequest::Exit
        ));
    }

    #[test]
    fn test_ready_response() {
        let line = WorkResponse::Ready { pid: 4242 }.to_line().unwrap();
        assert_eq!(
            WorkResponse::from_line(&line).unwrap(),
            WorkResponse::Ready { pid: 4242 }
        );
    }

    #[test]
    fn test_failed_response() {
        let resp = WorkResponse::failed(3, "division by zero");
        let line = resp.to_line().unwrap();
        assert!(line.contains("failed"));
        match WorkResponse::from_line(&line).unwrap() {
            WorkResponse::Failed { task, message } => {
                assert_eq!(task, 3);
                assert_eq!(message, "division by zero");
            }
            other => panic!("Expected Failed variant, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(WorkResponse::from_line("{\"type\":\"restart\"}").is_err());
        assert!(WorkRequest::from_line("not json").is_err());
    }
}
