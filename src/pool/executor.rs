//! Executors: the unit of behaviour bound to one worker for its lifetime.

use crate::error::{InitError, TaskError};

/// A resolved executor: called once per task inside the worker process.
pub type TaskFn<A, R> = Box<dyn FnMut(A) -> Result<R, TaskError> + Send>;

/// Factory run once inside the worker process to build the real executor.
pub type Factory<A, R> = Box<dyn FnOnce() -> Result<TaskFn<A, R>, InitError> + Send>;

/// Executor supplied at pool construction, one per worker.
pub enum Executor<A, R> {
    /// Ready to call.
    Direct(TaskFn<A, R>),
    /// Built inside the worker, for state that must not be shared across
    /// process boundaries (open handles, connections, per-process caches).
    Deferred(Factory<A, R>),
}

impl<A, R> Executor<A, R> {
    /// Wrap a ready-to-call function.
    pub fn direct<F>(f: F) -> Self
    where
        F: FnMut(A) -> Result<R, TaskError> + Send + 'static,
    {
        Self::Direct(Box::new(f))
    }

    /// Wrap a factory that builds the executor inside the worker process.
    pub fn deferred<M, F>(factory: M) -> Self
    where
        M: FnOnce() -> Result<F, InitError> + Send + 'static,
        F: FnMut(A) -> Result<R, TaskError> + Send + 'static,
    {
        Self::Deferred(Box::new(move || {
            let f = factory()?;
            Ok(Box::new(f) as TaskFn<A, R>)
        }))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Resolve into the callable. Runs the factory for deferred executors.
    pub(crate) fn resolve(self) -> Result<TaskFn<A, R>, InitError> {
        match self {
            Self::Direct(f) => Ok(f),
            Self::Deferred(factory) => factory(),
        }
    }
}

impl<A, R> std::fmt::Debug for Executor<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => write!(f, "Executor::Direct"),
            Self::Deferred(_) => write!(f, "Executor::Deferred"),
        }
    }
}

/// Report of a worker's resolved executor, published once it initialized.
///
/// The callable itself lives in the worker process; this is what the
/// controller can see of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorHandle {
    /// Index of the worker (and of the executor passed to the pool).
    pub worker: usize,
    /// PID of the process the executor was resolved in.
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_direct_resolves_to_same_function() {
        let executor: Executor<i32, i32> = Executor::direct(|x| Ok(x * 2));
        assert!(!executor.is_deferred());
        let mut f = executor.resolve().unwrap();
        assert_eq!(f(21), Ok(42));
    }

    #[test]
    fn test_deferred_factory_runs_once_on_resolve() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor: Executor<i32, i32> = Executor::deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let offset = 100;
            Ok(move |x| Ok(x + offset))
        });
        assert!(executor.is_deferred());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut f = executor.resolve().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f(1), Ok(101));
        assert_eq!(f(2), Ok(102));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_factory_failure() {
        let executor: Executor<i32, i32> =
            Executor::deferred(|| Err::<fn(i32) -> Result<i32, TaskError>, _>(InitError::new("no db")));
        match executor.resolve() {
            Err(e) => assert_eq!(e.to_string(), "no db"),
            Ok(_) => panic!("expected factory failure"),
        }
    }

    #[test]
    fn test_executor_state_is_kept_between_calls() {
        let mut seen = 0;
        let executor: Executor<i32, i32> = Executor::direct(move |x| {
            seen += x;
            Ok(seen)
        });
        let mut f = executor.resolve().unwrap();
        assert_eq!(f(1), Ok(1));
        assert_eq!(f(2), Ok(3));
    }
}
