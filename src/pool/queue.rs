//! FIFO queue with empty/non-empty waits and a put counter.
//!
//! A plain channel cannot answer "is everything drained *and* will nothing
//! else arrive". The put counter turns that race into a retryable check:
//! sample the counter, wait, then compare.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Queue operation failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is full")]
    Full,
}

/// Synchronized counting queue.
pub struct WaitableQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    empty: Condvar,
    not_full: Condvar,
    put_counter: AtomicU64,
    /// 0 = unbounded
    maxsize: usize,
}

impl<T> Default for WaitableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitableQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::bounded(0)
    }

    /// Create a queue holding at most `maxsize` items (0 = unbounded).
    pub fn bounded(maxsize: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            empty: Condvar::new(),
            not_full: Condvar::new(),
            put_counter: AtomicU64::new(0),
            maxsize,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_full(&self, items: &VecDeque<T>) -> bool {
        self.maxsize > 0 && items.len() >= self.maxsize
    }

    fn push_locked(&self, items: &mut VecDeque<T>, item: T) {
        items.push_back(item);
        self.put_counter.fetch_add(1, Ordering::SeqCst);
        if items.len() == 1 {
            self.not_empty.notify_all();
        }
    }

    fn pop_locked(&self, items: &mut VecDeque<T>) -> Option<T> {
        let item = items.pop_front()?;
        if items.is_empty() {
            self.empty.notify_all();
        }
        if self.maxsize > 0 {
            self.not_full.notify_one();
        }
        Some(item)
    }

    /// Append an item, waiting for room if the queue is bounded and full.
    pub fn put(&self, item: T) {
        let mut items = self.lock();
        while self.is_full(&items) {
            items = self.not_full.wait(items).unwrap_or_else(|e| e.into_inner());
        }
        self.push_locked(&mut items, item);
    }

    /// Append an item without waiting; fails with `Full` on a full bounded queue.
    pub fn try_put(&self, item: T) -> Result<(), (QueueError, T)> {
        let mut items = self.lock();
        if self.is_full(&items) {
            return Err((QueueError::Full, item));
        }
        self.push_locked(&mut items, item);
        Ok(())
    }

    /// Remove and return the head item.
    ///
    /// Non-blocking mode fails immediately when empty. Blocking mode waits up
    /// to `timeout` (forever if `None`).
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T, QueueError> {
        if block {
            self.get_then(timeout, |_| {})
        } else {
            let mut items = self.lock();
            self.pop_locked(&mut items).ok_or(QueueError::Empty)
        }
    }

    /// Blocking get that runs `on_take` while the lock is still held.
    ///
    /// Observers that check `is_empty` and then some flag set by `on_take`
    /// can never see the item in neither place.
    pub fn get_then<F>(&self, timeout: Option<Duration>, on_take: F) -> Result<T, QueueError>
    where
        F: FnOnce(&T),
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut items = self.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut items) {
                on_take(&item);
                return Ok(item);
            }
            items = match deadline {
                None => self.not_empty.wait(items).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Empty);
                    }
                    self.not_empty
                        .wait_timeout(items, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Block until the queue is empty. Returns whether it is empty on return.
    pub fn wait_empty(&self, timeout: Option<Duration>) -> bool {
        let items = self.lock();
        let items = match timeout {
            None => self
                .empty
                .wait_while(items, |q| !q.is_empty())
                .unwrap_or_else(|e| e.into_inner()),
            Some(t) => {
                self.empty
                    .wait_timeout_while(items, t, |q| !q.is_empty())
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
        };
        items.is_empty()
    }

    /// Block until the queue holds something. Returns whether it does on return.
    pub fn wait_not_empty(&self, timeout: Option<Duration>) -> bool {
        let items = self.lock();
        let items = match timeout {
            None => self
                .not_empty
                .wait_while(items, |q| q.is_empty())
                .unwrap_or_else(|e| e.into_inner()),
            Some(t) => {
                self.not_empty
                    .wait_timeout_while(items, t, |q| q.is_empty())
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
        };
        !items.is_empty()
    }

    /// Total number of puts ever made.
    pub fn put_counter(&self) -> u64 {
        self.put_counter.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take everything currently queued, in order.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.lock();
        let drained: Vec<T> = items.drain(..).collect();
        if !drained.is_empty() {
            self.empty.notify_all();
            self.not_full.notify_all();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = WaitableQueue::new();
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.get(false, None), Ok(1));
        assert_eq!(q.get(false, None), Ok(2));
        assert_eq!(q.get(false, None), Ok(3));
        assert_eq!(q.get(false, None), Err(QueueError::Empty));
    }

    #[test]
    fn test_put_counter_is_monotonic() {
        let q = WaitableQueue::new();
        assert_eq!(q.put_counter(), 0);
        q.put("a");
        q.put("b");
        q.get(false, None).unwrap();
        q.put("c");
        q.drain();
        assert_eq!(q.put_counter(), 3);
    }

    #[test]
    fn test_blocking_get_times_out() {
        let q: WaitableQueue<u8> = WaitableQueue::new();
        let start = Instant::now();
        assert_eq!(
            q.get(true, Some(Duration::from_millis(50))),
            Err(QueueError::Empty)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let q = Arc::new(WaitableQueue::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                q.put(42);
            })
        };
        assert_eq!(q.get(true, Some(Duration::from_secs(5))), Ok(42));
        producer.join().unwrap();
    }

    #[test]
    fn test_get_then_runs_under_lock() {
        let q = WaitableQueue::new();
        q.put(7);
        let mut seen = None;
        let item = q
            .get_then(Some(Duration::from_millis(10)), |v| seen = Some(*v))
            .unwrap();
        assert_eq!(item, 7);
        assert_eq!(seen, Some(7));
    }

    #[test]
    fn test_wait_empty_returns_immediately_when_empty() {
        let q: WaitableQueue<u8> = WaitableQueue::new();
        let start = Instant::now();
        assert!(q.wait_empty(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_empty_wakes_when_drained() {
        let q = Arc::new(WaitableQueue::new());
        q.put(1);
        q.put(2);
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                q.get(false, None).unwrap();
                q.get(false, None).unwrap();
            })
        };
        assert!(q.wait_empty(Some(Duration::from_secs(5))));
        consumer.join().unwrap();
    }

    #[test]
    fn test_wait_not_empty_times_out() {
        let q: WaitableQueue<u8> = WaitableQueue::new();
        assert!(!q.wait_not_empty(Some(Duration::from_millis(20))));
        q.put(1);
        assert!(q.wait_not_empty(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_bounded_try_put() {
        let q = WaitableQueue::bounded(1);
        assert!(q.try_put(1).is_ok());
        assert_eq!(q.try_put(2), Err((QueueError::Full, 2)));
        q.get(false, None).unwrap();
        assert!(q.try_put(3).is_ok());
    }

    #[test]
    fn test_bounded_put_waits_for_room() {
        let q = Arc::new(WaitableQueue::bounded(1));
        q.put(1);
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.put(2))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(true, Some(Duration::from_secs(1))), Ok(1));
        producer.join().unwrap();
        assert_eq!(q.get(true, Some(Duration::from_secs(1))), Ok(2));
    }

    #[test]
    fn test_drain_takes_everything() {
        let q = WaitableQueue::new();
        for i in 0..5 {
            q.put(i);
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }
}
