//! Pool configuration.
//!
//! # Environment Variables
//!
//! Applied by [`PoolConfig::with_env_overrides`]:
//!
//! - `PROCPOOL_POLL_INTERVAL_MS` - stop-flag / queue poll interval
//! - `PROCPOOL_SETTLE_DELAY_MS` - settle delay used by `wait` and `stop`
//! - `PROCPOOL_FINISH_TIMEOUT_MS` - default `stop` timeout
//! - `PROCPOOL_MAX_TASK_FAILURES` - crash resubmission limit (unset = unbounded)

use std::time::Duration;

/// Configuration for a [`Pool`](super::Pool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// How often idle workers re-check their stop flag.
    pub poll_interval: Duration,
    /// Grace period for in-flight puts before declaring the pool drained.
    pub settle_delay: Duration,
    /// Default time `stop` waits for workers before force-terminating them.
    pub finish_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when force-terminating.
    pub terminate_grace: Duration,
    /// Number of worker crashes a single task may cause before it is
    /// dropped into the failed log. `None` resubmits forever.
    pub max_task_failures: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(100),
            finish_timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_millis(100),
            max_task_failures: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Cap crash-triggered resubmissions of a single task.
    pub fn with_max_task_failures(mut self, limit: u32) -> Self {
        self.max_task_failures = Some(limit);
        self
    }

    /// Apply `PROCPOOL_*` environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("PROCPOOL_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PROCPOOL_SETTLE_DELAY_MS") {
            self.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PROCPOOL_FINISH_TIMEOUT_MS") {
            self.finish_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = env_u64("PROCPOOL_MAX_TASK_FAILURES") {
            self.max_task_failures = u32::try_from(limit).ok();
        }
        self
    }

    /// Whether a task that has crashed `failures` workers may be resubmitted.
    pub(crate) fn allows_resubmit(&self, failures: u32) -> bool {
        self.max_task_failures.is_none_or(|limit| failures < limit)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring invalid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.settle_delay, Duration::from_millis(100));
        assert_eq!(config.finish_timeout, Duration::from_secs(1));
        assert!(config.max_task_failures.is_none());
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_settle_delay(Duration::from_millis(20))
            .with_finish_timeout(Duration::from_secs(3))
            .with_terminate_grace(Duration::from_millis(5))
            .with_max_task_failures(2);

        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.settle_delay, Duration::from_millis(20));
        assert_eq!(config.finish_timeout, Duration::from_secs(3));
        assert_eq!(config.terminate_grace, Duration::from_millis(5));
        assert_eq!(config.max_task_failures, Some(2));
    }

    #[test]
    fn test_allows_resubmit() {
        let unbounded = PoolConfig::default();
        assert!(unbounded.allows_resubmit(0));
        assert!(unbounded.allows_resubmit(1_000));

        let capped = PoolConfig::default().with_max_task_failures(2);
        assert!(capped.allows_resubmit(1));
        assert!(!capped.allows_resubmit(2));
    }

    #[test]
    fn test_env_u64_missing_variable() {
        assert_eq!(env_u64("PROCPOOL_TEST_SURELY_UNSET_VARIABLE"), None);
    }
}
