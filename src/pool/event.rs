//! Boolean flag with blocking wait.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A settable, clearable flag that threads can wait on.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(initial: bool) -> Self {
        Self {
            flag: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until set. Returns the flag's value on return.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let flag = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        let flag = match timeout {
            None => self
                .cond
                .wait_while(flag, |set| !*set)
                .unwrap_or_else(|e| e.into_inner()),
            Some(t) => {
                self.cond
                    .wait_timeout_while(flag, t, |set| !*set)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
        };
        *flag
    }
}
