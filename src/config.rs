//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::scheduler::QueuePolicy;

/// Task controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ordering of both the pending-task and idle-worker queues.
    pub queue_policy: QueuePolicy,
    /// How long pending tasks may sit with every worker idle yet unable to
    /// take them before they fail with a timeout. `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Delay before a worker that just failed a task rejoins the idle pool.
    pub failure_penalty: Duration,
    /// Capacity of the controller's command mailbox.
    pub mailbox_capacity: usize,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_policy: QueuePolicy::Fifo,
            idle_timeout: Some(Duration::from_secs(30)),
            failure_penalty: Duration::from_secs(1),
            mailbox_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// Build from `TASK_FARM_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("TASK_FARM_QUEUE_POLICY") {
            config.queue_policy = raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "TASK_FARM_QUEUE_POLICY".into(),
                message,
            })?;
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "TASK_FARM_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "TASK_FARM_FAILURE_PENALTY_MS")? {
            config.failure_penalty = Duration::from_millis(ms);
        }

        if let Some(capacity) = parse_number::<usize>(&lookup, "TASK_FARM_MAILBOX_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "TASK_FARM_MAILBOX_CAPACITY".into(),
                    message: "must be greater than zero".into(),
                });
            }
            config.mailbox_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse_number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}
