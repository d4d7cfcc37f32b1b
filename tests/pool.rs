//! Behavioural tests for the worker pool.
//!
//! Every test forks real worker processes.

use procpool::{
    Executor, InitError, Pool, PoolConfig, TaskError, TerminationReason, WorkerState,
};
use nix::sys::signal::{SigSet, Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork, getpid};
use procpool::pool::SignalMask;
use std::collections::HashSet;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> PoolConfig {
    PoolConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_settle_delay(Duration::from_millis(20))
        .with_terminate_grace(Duration::from_secs(1))
}

fn identity_pool(workers: usize) -> Pool<i64, i64> {
    let executors = (0..workers)
        .map(|_| Executor::direct(|x: i64| Ok(x)))
        .collect();
    Pool::with_config(executors, fast_config()).unwrap()
}

fn always_failing() -> Executor<i64, i64> {
    Executor::direct(|x: i64| Err(TaskError::failed(format!("cannot handle {}", x))))
}

fn sorted(mut values: Vec<i64>) -> Vec<i64> {
    values.sort_unstable();
    values
}

/// Poll `condition` until it holds or `timeout` passes.
fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_identity_values_on_three_workers() {
    let mut pool = identity_pool(3);
    for value in [5, 12, 7, 0, -3] {
        pool.submit(value);
    }

    assert!(pool.wait(true, 0, true));
    assert_eq!(sorted(pool.results().snapshot()), vec![-3, 0, 5, 7, 12]);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_many_tasks_produce_exactly_one_result_each() {
    let executors = (0..4)
        .map(|_| Executor::direct(|x: i64| Ok(x * 2)))
        .collect();
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();
    for x in 0..100 {
        pool.submit(x);
    }

    assert!(pool.wait(true, 0, true));
    let results = pool.results();
    assert_eq!(results.len(), 100);
    assert_eq!(sorted(results.snapshot()), (0..100).map(|x| x * 2).collect::<Vec<_>>());

    let stats = pool.stats();
    assert_eq!(stats.submitted, 100);
    assert_eq!(stats.completed, 100);
    assert_eq!(stats.crashed_workers, 0);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_task_ids_are_sequential() {
    let pool = identity_pool(1);
    assert_eq!(pool.submit(1), 0);
    assert_eq!(pool.submit(1), 1);
    assert_eq!(pool.submit(1), 2);
}

#[test]
fn test_retry_once_appears_once() {
    let dir = tempfile::tempdir().unwrap();
    let marker_dir: PathBuf = dir.path().to_path_buf();
    let executors = (0..2)
        .map(|_| {
            let marker_dir = marker_dir.clone();
            Executor::direct(move |x: i64| {
                // First attempt of each value leaves a marker and asks for a retry.
                let marker = marker_dir.join(x.to_string());
                match std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&marker)
                {
                    Ok(_) => Err(TaskError::Retry),
                    Err(_) => Ok(x),
                }
            })
        })
        .collect();
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();
    for x in 0..5 {
        pool.submit(x);
    }

    assert!(pool.wait(true, 0, true));
    assert_eq!(sorted(pool.results().snapshot()), vec![0, 1, 2, 3, 4]);
    assert_eq!(pool.stats().retried, 5);
    assert_eq!(pool.live_workers(), 2);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_failing_task_kills_its_worker_and_stays_queued() {
    let mut pool: Pool<i64, i64> =
        Pool::with_config(vec![always_failing()], fast_config()).unwrap();
    pool.submit(42);

    // The only worker died; the task is queued with nobody left to run it.
    assert!(!pool.wait(true, 0, true));
    assert_eq!(pool.live_workers(), 0);
    assert_eq!(pool.worker_states(), vec![WorkerState::Crashed]);

    let failures = pool.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].worker, 0);
    assert_eq!(failures[0].reason, TerminationReason::TaskFailed);
    assert_eq!(failures[0].message.as_deref(), Some("cannot handle 42"));

    let aborted = pool.stop(None);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].args, 42);
    assert_eq!(aborted[0].failures, 1);
    assert!(pool.results().is_empty());
}

#[test]
fn test_failing_task_kills_workers_one_at_a_time() {
    let executors = (0..3).map(|_| always_failing()).collect();
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();
    pool.submit(7);

    let mut live = vec![pool.live_workers()];
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        let now = pool.live_workers();
        if live.last() != Some(&now) {
            live.push(now);
        }
        if now == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(live.first(), Some(&3));
    assert_eq!(live.last(), Some(&0));
    assert!(live.windows(2).all(|w| w[1] < w[0]), "{:?}", live);

    assert!(!pool.wait(true, 0, true));
    assert_eq!(pool.worker_states(), vec![WorkerState::Crashed; 3]);
    let failures = pool.failures();
    assert_eq!(failures.len(), 3);
    assert!(failures.iter().all(|f| f.reason == TerminationReason::TaskFailed));
    let workers: HashSet<_> = failures.iter().map(|f| f.worker).collect();
    assert_eq!(workers, HashSet::from([0, 1, 2]));

    let aborted = pool.stop(None);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].args, 7);
    assert_eq!(aborted[0].failures, 3);
}

#[test]
fn test_panicking_executor_counts_as_failure() {
    let executors = vec![Executor::direct(|x: i64| -> Result<i64, TaskError> {
        panic!("bad input {}", x)
    })];
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();
    pool.submit(1);

    assert!(!pool.wait(true, 0, true));
    let failures = pool.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.as_deref().unwrap_or("").contains("bad input 1"));
    assert_eq!(pool.stop(None).len(), 1);
}

#[test]
fn test_mixed_pool_survivor_produces_results() {
    let executors = vec![always_failing(), Executor::direct(|x: i64| Ok(x))];
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();

    // Whichever worker takes a task first; the failing one dies on its first.
    let mut submitted = Vec::new();
    for x in 0..50 {
        pool.submit(x);
        submitted.push(x);
        assert!(pool.wait(true, 0, true));
        if !pool.failures().is_empty() {
            break;
        }
    }

    assert_eq!(pool.failures().len(), 1);
    assert_eq!(pool.live_workers(), 1);
    assert_eq!(
        pool.worker_states(),
        vec![WorkerState::Crashed, WorkerState::Idle]
    );
    assert_eq!(sorted(pool.results().snapshot()), submitted);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_crash_limit_moves_task_to_failed_log() {
    let config = fast_config().with_max_task_failures(1);
    let mut pool: Pool<i64, i64> = Pool::with_config(vec![always_failing()], config).unwrap();
    pool.submit(9);

    assert!(pool.wait(true, 0, true));
    let failed = pool.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].args, 9);
    assert_eq!(failed[0].failures, 1);
    assert_eq!(pool.stats().failed_tasks, 1);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_stop_on_idle_pool_returns_nothing() {
    let mut pool = identity_pool(2);
    pool.submit(1);
    assert!(pool.wait(true, 0, true));

    assert!(pool.stop(Some(Duration::ZERO)).is_empty());
    assert!(pool.is_stopped());
    assert_eq!(pool.live_workers(), 0);
    assert_eq!(pool.results().snapshot(), vec![1]);
}

#[test]
fn test_stop_is_idempotent() {
    let mut pool = identity_pool(1);
    assert!(pool.stop(None).is_empty());
    assert!(pool.stop(None).is_empty());
    assert!(pool.worker_states().iter().all(|s| s.is_final()));
    assert_eq!(pool.live_workers(), 0);
}

#[test]
fn test_submit_after_stop_is_returned_by_next_stop() {
    let mut pool = identity_pool(1);
    assert!(pool.stop(None).is_empty());

    let id = pool.submit(9);
    let aborted = pool.stop(None);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].id, id);
    assert_eq!(aborted[0].args, 9);
    assert!(pool.stop(None).is_empty());
    assert!(pool.results().is_empty());
}

/// Runs in a forked child: SIGTERM is sent to the whole process while `stop`
/// waits for a slow task. Returns whether `stop` completed normally and the
/// signal was still pending afterwards.
fn stop_with_pending_sigterm() -> bool {
    let executors = vec![Executor::direct(|millis: u64| {
        thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    })];
    let mut pool: Pool<u64, u64> = Pool::with_config(executors, fast_config()).unwrap();
    pool.submit(1_500);
    if !eventually(Duration::from_secs(10), || pool.busy_workers() == 1) {
        return false;
    }

    // Pool threads already exist; only this thread and the sender block here.
    let _outer = SignalMask::interrupts().unwrap();
    let sender = thread::spawn(|| {
        thread::sleep(Duration::from_millis(300));
        kill(getpid(), Signal::SIGTERM).is_ok()
    });

    let aborted = pool.stop(Some(Duration::from_secs(5)));
    let sent = sender.join().unwrap_or(false);

    let mut term = SigSet::empty();
    term.add(Signal::SIGTERM);
    let pending = term.wait() == Ok(Signal::SIGTERM);

    sent && pending && aborted.is_empty() && pool.results().snapshot() == vec![1_500]
}

#[test]
fn test_sigterm_during_stop_is_deferred() {
    // Forked so the signal only reaches a process whose threads are all ours.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = match std::panic::catch_unwind(stop_with_pending_sigterm) {
                Ok(true) => 0,
                Ok(false) => 1,
                Err(_) => 2,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).unwrap();
            assert_eq!(status, WaitStatus::Exited(child, 0));
        }
    }
}

#[test]
fn test_stop_returns_queued_and_in_flight_tasks() {
    let executors = (0..2)
        .map(|_| {
            Executor::direct(|millis: u64| {
                thread::sleep(Duration::from_millis(millis));
                Ok(millis)
            })
        })
        .collect();
    let mut pool: Pool<u64, u64> = Pool::with_config(executors, fast_config()).unwrap();
    for _ in 0..10 {
        pool.submit(2_000);
    }
    assert!(eventually(Duration::from_secs(10), || pool.busy_workers() == 2
        && pool.stats().queued == 8));

    let aborted = pool.stop(Some(Duration::ZERO));
    let completed = pool.results().len();
    assert!(aborted.len() >= 8 && aborted.len() <= 10, "aborted {}", aborted.len());
    assert_eq!(aborted.len() + completed, 10);
    assert!(pool.stats().forced_terminations >= 1);

    let ids: HashSet<_> = aborted.iter().map(|t| t.id).collect();
    assert_eq!(ids.len(), aborted.len());
}

#[test]
fn test_stop_lets_running_tasks_finish_within_timeout() {
    let executors = vec![Executor::direct(|millis: u64| {
        thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    })];
    let mut pool: Pool<u64, u64> = Pool::with_config(executors, fast_config()).unwrap();
    pool.submit(200);
    pool.submit(200);
    assert!(eventually(Duration::from_secs(10), || pool.busy_workers() == 1
        && pool.stats().queued == 1));

    let aborted = pool.stop(Some(Duration::from_secs(10)));
    assert_eq!(aborted.len(), 1);
    assert_eq!(pool.results().snapshot(), vec![200]);
    assert_eq!(pool.stats().forced_terminations, 0);
}

#[test]
fn test_keepalive_spares_shrinks_idle_workers() {
    let mut pool = identity_pool(4);
    for x in 0..8 {
        pool.submit(x);
    }

    assert!(pool.wait(false, 1, true));
    assert!(eventually(Duration::from_secs(10), || pool.live_workers() == 1));
    let states = pool.worker_states();
    assert_eq!(
        states.iter().filter(|s| **s == WorkerState::Terminated).count(),
        3
    );
    assert!(pool.failures().is_empty());

    // The spare keeps serving.
    pool.submit(100);
    assert!(pool.wait(true, 0, true));
    assert!(pool.results().snapshot().contains(&100));
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_non_blocking_wait_reports_busy_pool() {
    let executors = vec![Executor::direct(|millis: u64| {
        thread::sleep(Duration::from_millis(millis));
        Ok(millis)
    })];
    let mut pool: Pool<u64, u64> = Pool::with_config(executors, fast_config()).unwrap();
    pool.submit(300);
    assert!(!pool.wait(true, 0, false));
    assert!(pool.wait(true, 0, true));
    assert!(eventually(Duration::from_secs(5), || pool.wait(true, 0, false)));
    pool.stop(None);
}

#[test]
fn test_deferred_executors_resolve_in_worker_processes() {
    let executors = (0..2)
        .map(|worker| {
            Executor::deferred(move || {
                let pid = std::process::id();
                Ok(move |x: i64| Ok((worker, pid, x)))
            })
        })
        .collect();
    let mut pool: Pool<i64, (usize, u32, i64)> =
        Pool::with_config(executors, fast_config()).unwrap();

    let handles = pool.executors().to_vec();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].worker, 0);
    assert_eq!(handles[1].worker, 1);
    assert_ne!(handles[0].pid, std::process::id());
    assert_ne!(handles[0].pid, handles[1].pid);

    pool.submit(7);
    assert!(pool.wait(true, 0, true));
    let (worker, pid, x) = pool.results().get(0).unwrap();
    assert_eq!(x, 7);
    assert_eq!(handles[worker].pid, pid);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_failing_factory_leaves_worker_init_failed() {
    let executors = vec![
        Executor::deferred(|| Err::<fn(i64) -> Result<i64, TaskError>, _>(InitError::new("no handle"))),
        Executor::direct(|x: i64| Ok(x)),
    ];
    let mut pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();

    let handles = pool.executors().to_vec();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].worker, 1);
    assert_eq!(pool.worker_states()[0], WorkerState::InitFailed);

    let failures = pool.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, TerminationReason::InitFailed);
    assert_eq!(failures[0].message.as_deref(), Some("no handle"));

    pool.submit(3);
    assert!(pool.wait(true, 0, true));
    assert_eq!(pool.results().snapshot(), vec![3]);
    assert!(pool.stop(None).is_empty());
}

#[test]
fn test_results_iterator_ends_after_stop() {
    let mut pool = identity_pool(2);
    for x in [1, 2, 3] {
        pool.submit(x);
    }
    assert!(pool.wait(true, 0, true));
    let results = pool.results();
    assert!(!results.is_complete());

    pool.stop(None);
    assert!(results.is_complete());
    assert_eq!(sorted(results.iter().collect()), vec![1, 2, 3]);

    let mut iter = results.iter();
    assert_eq!(iter.by_ref().count(), 3);
    iter.rewind();
    assert_eq!(iter.count(), 3);
}

#[test]
fn test_results_complete_when_no_worker_survives() {
    let executors = vec![Executor::deferred(|| {
        Err::<fn(i64) -> Result<i64, TaskError>, _>(InitError::new("unavailable"))
    })];
    let pool: Pool<i64, i64> = Pool::with_config(executors, fast_config()).unwrap();

    // Returns instead of blocking: the log closes once every worker is gone.
    assert_eq!(pool.results().iter().count(), 0);
    assert!(pool.results().is_complete());
}

#[test]
fn test_dropping_pool_stops_workers() {
    let mut pool = identity_pool(2);
    let pids: Vec<u32> = pool.executors().iter().map(|h| h.pid).collect();
    drop(pool);

    for pid in pids {
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        assert!(!alive, "worker {} still running", pid);
    }
}
