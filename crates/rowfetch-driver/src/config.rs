use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use rowfetch::PoolConfig;

/// Runtime configuration for the `rowfetch-driver` binary.
///
/// The driver builds an in-memory index, starts one worker pool and runs
/// rounds of concurrent scans against it. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "rowfetch-driver",
    version,
    about = "Runs concurrent synthetic index scans through a rowfetch worker pool"
)]
pub struct CliArgs {
    /// Number of lookup workers in the pool. Defaults to the number of CPUs.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Capacity of the shared request queue. Defaults to 256 slots per worker.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Capacity of each scan's direct result channel.
    ///
    /// Environment variable: `SINK_CHANNEL_CAPACITY`
    #[arg(long, env = "SINK_CHANNEL_CAPACITY", default_value_t = rowfetch::DEFAULT_SINK_CHANNEL_CAPACITY)]
    pub sink_channel_capacity: usize,

    /// Initial capacity reserved for each scan's overflow backlog.
    ///
    /// Environment variable: `SINK_BACKLOG_CAPACITY`
    #[arg(long, env = "SINK_BACKLOG_CAPACITY", default_value_t = rowfetch::DEFAULT_SINK_BACKLOG_CAPACITY)]
    pub sink_backlog_capacity: usize,

    /// Number of rows in the synthetic index.
    ///
    /// Environment variable: `INDEX_ROWS`
    #[arg(long, env = "INDEX_ROWS", default_value_t = 100_000)]
    pub index_rows: usize,

    /// Keys looked up by each scan.
    ///
    /// Environment variable: `KEYS_PER_SCAN`
    #[arg(long, env = "KEYS_PER_SCAN", default_value_t = 1_000)]
    pub keys_per_scan: usize,

    /// Scans running at the same time in each round.
    ///
    /// Environment variable: `CONCURRENT_SCANS`
    #[arg(long, env = "CONCURRENT_SCANS", default_value_t = 8)]
    pub concurrent_scans: usize,

    /// Rounds to run. `0` keeps running until interrupted.
    ///
    /// Environment variable: `ROUNDS`
    #[arg(long, env = "ROUNDS", default_value_t = 1)]
    pub rounds: usize,

    /// Simulated latency of one lookup, in microseconds.
    ///
    /// Environment variable: `LOOKUP_LATENCY_US`
    #[arg(long, env = "LOOKUP_LATENCY_US", default_value_t = 50)]
    pub lookup_latency_us: u64,

    /// Fraction of keys, in `[0, 1]`, that have no row in the index.
    ///
    /// Environment variable: `MISS_RATIO`
    #[arg(long, env = "MISS_RATIO", default_value_t = 0.01)]
    pub miss_ratio: f64,

    /// Make the lookup panic on every Nth index row. `0` disables it.
    ///
    /// Environment variable: `PANIC_EVERY`
    #[arg(long, env = "PANIC_EVERY", default_value_t = 0)]
    pub panic_every: usize,

    /// Seconds to wait for workers to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_SECS`
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

/// Validated settings for one workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    pub index_rows: usize,
    pub keys_per_scan: usize,
    pub concurrent_scans: usize,
    pub rounds: usize,
    pub lookup_latency: Duration,
    pub miss_ratio: f64,
    pub panic_every: usize,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub pool: PoolConfig,
    pub workload: WorkloadConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<CliArgs> for DriverConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let mut pool = PoolConfig::default();
        if let Some(num_workers) = args.num_workers {
            pool.num_workers = num_workers;
            pool.queue_capacity = num_workers.saturating_mul(rowfetch::QUEUE_SLOTS_PER_WORKER);
        }
        if let Some(queue_capacity) = args.queue_capacity {
            pool.queue_capacity = queue_capacity;
        }
        pool.sink_channel_capacity = args.sink_channel_capacity;
        pool.sink_backlog_capacity = args.sink_backlog_capacity;
        pool.validate()?;

        if args.index_rows == 0 {
            bail!("INDEX_ROWS must be greater than 0");
        }
        if args.concurrent_scans == 0 {
            bail!("CONCURRENT_SCANS must be greater than 0");
        }
        if !(0.0..=1.0).contains(&args.miss_ratio) {
            bail!("MISS_RATIO ({}) must be within [0, 1]", args.miss_ratio);
        }

        Ok(Self {
            pool,
            workload: WorkloadConfig {
                index_rows: args.index_rows,
                keys_per_scan: args.keys_per_scan,
                concurrent_scans: args.concurrent_scans,
                rounds: args.rounds,
                lookup_latency: Duration::from_micros(args.lookup_latency_us),
                miss_ratio: args.miss_ratio,
                panic_every: args.panic_every,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<DriverConfig> {
        let argv = core::iter::once("rowfetch-driver").chain(args.iter().copied());
        DriverConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn worker_count_sizes_the_queue() {
        let config = parse(&["--num-workers", "3"]).unwrap();
        assert_eq!(config.pool.num_workers, 3);
        assert_eq!(config.pool.queue_capacity, 3 * rowfetch::QUEUE_SLOTS_PER_WORKER);
    }

    #[test]
    fn explicit_queue_capacity_wins() {
        let config = parse(&["--num-workers", "3", "--queue-capacity", "10"]).unwrap();
        assert_eq!(config.pool.queue_capacity, 10);
    }

    #[test]
    fn latency_is_read_in_microseconds() {
        let config = parse(&["--lookup-latency-us", "1500"]).unwrap();
        assert_eq!(config.workload.lookup_latency, Duration::from_micros(1500));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = parse(&["--num-workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("num_workers"));
    }

    #[test]
    fn miss_ratio_out_of_range_is_rejected() {
        let err = parse(&["--miss-ratio", "1.5"]).unwrap_err();
        assert!(err.to_string().contains("MISS_RATIO"));
    }

    #[test]
    fn empty_index_is_rejected() {
        assert!(parse(&["--index-rows", "0"]).is_err());
    }
}
