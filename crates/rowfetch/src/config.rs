use rowfetch_core::{
    DEFAULT_SINK_BACKLOG_CAPACITY, DEFAULT_SINK_CHANNEL_CAPACITY, Error, QUEUE_SLOTS_PER_WORKER,
    Result,
};

/// Sizing for a [`WorkerPool`](crate::WorkerPool) and the sinks created
/// through its dispatchers. Fixed for the lifetime of the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of long-lived worker tasks.
    pub num_workers: usize,
    /// Capacity of the shared request queue. Submitters wait when it is full.
    pub queue_capacity: usize,
    /// Capacity of each sink's bounded result channel.
    pub sink_channel_capacity: usize,
    /// Initial capacity of each sink's overflow backlog. The backlog grows
    /// past this as needed.
    pub sink_backlog_capacity: usize,
}

impl PoolConfig {
    /// A config with `num_workers` workers and the default sizing derived from
    /// it.
    pub const fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            queue_capacity: num_workers.saturating_mul(QUEUE_SLOTS_PER_WORKER),
            sink_channel_capacity: DEFAULT_SINK_CHANNEL_CAPACITY,
            sink_backlog_capacity: DEFAULT_SINK_BACKLOG_CAPACITY,
        }
    }

    /// Rejects sizes the pool cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any capacity or the worker count is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("num_workers", self.num_workers),
            ("queue_capacity", self.queue_capacity),
            ("sink_channel_capacity", self.sink_channel_capacity),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((name, _)) => Err(Error::InvalidConfig {
                reason: format!("{name} must be greater than 0"),
            }),
            None => Ok(()),
        }
    }
}

impl Default for PoolConfig {
    /// One worker per available processor.
    fn default() -> Self {
        Self::with_workers(num_cpus::get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_scales_with_workers() {
        let config = PoolConfig::with_workers(4);
        assert_eq!(config.queue_capacity, 4 * QUEUE_SLOTS_PER_WORKER);
        assert_eq!(config.sink_channel_capacity, DEFAULT_SINK_CHANNEL_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_uses_available_processors() {
        let config = PoolConfig::default();
        assert_eq!(config.num_workers, num_cpus::get());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = PoolConfig::with_workers(0).validate().unwrap_err();
        assert_eq!(
            err,
            Error::InvalidConfig {
                reason: "num_workers must be greater than 0".to_string()
            }
        );

        let config = PoolConfig {
            sink_channel_capacity: 0,
            ..PoolConfig::with_workers(2)
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { reason }) if reason.contains("sink_channel_capacity")
        ));
    }

    #[test]
    fn zero_backlog_capacity_is_allowed() {
        let config = PoolConfig {
            sink_backlog_capacity: 0,
            ..PoolConfig::with_workers(1)
        };
        assert!(config.validate().is_ok());
    }
}
