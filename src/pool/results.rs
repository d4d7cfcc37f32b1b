//! Append-only result log, its blocking iterator, and the vacuum thread
//! that fills it from a queue.

use super::queue::WaitableQueue;
use super::spawn::spawn_named_thread;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
struct LogState<T> {
    items: Vec<T>,
    closed: bool,
}

/// Ordered, append-only sequence of values. Order is arrival order.
///
/// Once closed, no more values are appended and blocked readers wake up.
#[derive(Debug)]
pub struct ResultLog<T> {
    state: Mutex<LogState<T>>,
    grown: Condvar,
}

impl<T> Default for ResultLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultLog<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                items: Vec::new(),
                closed: false,
            }),
            grown: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: T) {
        self.extend(std::iter::once(item));
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.extend(items);
        if state.items.len() != before {
            self.grown.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the log complete and wake all readers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.grown.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Block until the log holds at least `len` entries or is closed.
    pub fn wait_len(&self, len: usize) -> bool {
        let state = self.lock();
        let state = self
            .grown
            .wait_while(state, |s| s.items.len() < len && !s.closed)
            .unwrap_or_else(|e| e.into_inner());
        state.items.len() >= len
    }

    /// Remove and return everything logged so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut self.lock().items)
    }
}

impl<T: Clone> ResultLog<T> {
    pub fn get(&self, index: usize) -> Option<T> {
        self.lock().items.get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.clone()
    }

    /// Block until entry `index` exists (returning it) or the log is closed
    /// without it (returning `None`).
    pub fn wait_for(&self, index: usize) -> Option<T> {
        let state = self.lock();
        let state = self
            .grown
            .wait_while(state, |s| s.items.len() <= index && !s.closed)
            .unwrap_or_else(|e| e.into_inner());
        state.items.get(index).cloned()
    }
}

/// Read view over a pool's results.
///
/// Indexable like a slice, and iterable through [`ResultIter`], which blocks
/// for the next value until the pool reports overall completion.
#[derive(Debug)]
pub struct Results<R> {
    log: Arc<ResultLog<R>>,
}

impl<R> Clone for Results<R> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
        }
    }
}

impl<R: Clone> Results<R> {
    pub(crate) fn new(log: Arc<ResultLog<R>>) -> Self {
        Self { log }
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<R> {
        self.log.get(index)
    }

    /// Copy of every value collected so far.
    pub fn snapshot(&self) -> Vec<R> {
        self.log.snapshot()
    }

    /// Whether no further values will ever arrive.
    pub fn is_complete(&self) -> bool {
        self.log.is_closed()
    }

    /// Iterator starting at the first result.
    pub fn iter(&self) -> ResultIter<R> {
        ResultIter {
            log: self.log.clone(),
            cursor: 0,
        }
    }
}

impl<R: Clone> IntoIterator for Results<R> {
    type Item = R;
    type IntoIter = ResultIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        ResultIter {
            log: self.log,
            cursor: 0,
        }
    }
}

/// Cursor over a result log.
///
/// `next` returns the value at the cursor, blocking until it arrives; it
/// returns `None` once the log is closed and the cursor reached its end.
#[derive(Debug)]
pub struct ResultIter<R> {
    log: Arc<ResultLog<R>>,
    cursor: usize,
}

impl<R> ResultIter<R> {
    /// Restart from the first result.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Index of the next value this iterator will return.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

impl<R: Clone> Iterator for ResultIter<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        let item = self.log.wait_for(self.cursor)?;
        self.cursor += 1;
        Some(item)
    }
}

/// Background thread moving items from a queue into a log.
///
/// Each cycle waits for the queue to become non-empty, then drains all
/// available items in one pass. Stopping performs a final drain.
pub struct Vacuum {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Vacuum {
    /// Start draining `queue` into `log`.
    ///
    /// With `close_when_idle`, the log is closed once the counter reaches
    /// zero and the queue is empty (no producer is left).
    pub fn spawn<T: Send + 'static>(
        name: &str,
        queue: Arc<WaitableQueue<T>>,
        log: Arc<ResultLog<T>>,
        poll_interval: Duration,
        close_when_idle: Option<Arc<AtomicUsize>>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = spawn_named_thread(name, move || {
            while !stop_flag.load(Ordering::SeqCst) {
                queue.wait_not_empty(Some(poll_interval));
                log.extend(queue.drain());

                if let Some(producers) = &close_when_idle
                    && producers.load(Ordering::SeqCst) == 0
                    && queue.is_empty()
                {
                    log.close();
                }
            }
            log.extend(queue.drain());
        })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the thread after a final drain, and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Vacuum thread panicked");
        }
    }
}

impl Drop for Vacuum {
    fn drop(&mut self) {
        self.stop();
    }
}
