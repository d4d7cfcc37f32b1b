//! Tasks: argument values travelling through the input queue.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Identifier assigned to a task at submission.
pub type TaskId = u64;

/// Values that can cross the controller/worker boundary.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// A submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task<A> {
    pub id: TaskId,
    pub args: A,
    /// Number of workers that crashed while running this task.
    pub failures: u32,
}

impl<A> Task<A> {
    pub fn new(id: TaskId, args: A) -> Self {
        Self {
            id,
            args,
            failures: 0,
        }
    }

    pub fn into_args(self) -> A {
        self.args
    }
}
