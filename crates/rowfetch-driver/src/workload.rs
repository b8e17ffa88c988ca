//! Synthetic index scans.
//!
//! The driver's "index" is a hash map from encoded row numbers to row
//! payloads. Each scan samples keys from it, a configurable share of which
//! miss, and fetches them through the pool like a query engine's index row
//! iterator would.

use crate::config::WorkloadConfig;
use bytes::Bytes;
use core::time::Duration;
use futures::future::join_all;
use rand::{Rng, rng};
use rowfetch::{
    CancellationToken, Dispatcher, Error, Key, LookupError, LookupFn, Result, lookup_fn,
};
use std::{collections::HashMap, sync::Arc, time::Instant};

/// A row fetched from the synthetic index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: u64,
    pub payload: Bytes,
}

/// In-memory stand-in for a table's primary storage.
#[derive(Debug)]
pub struct Index {
    rows: HashMap<Key, Row>,
}

impl Index {
    /// Builds an index of `size` rows keyed by their big-endian row number.
    pub fn build(size: usize) -> Self {
        let rows = (0..size as u64)
            .map(|id| {
                let payload = Bytes::from(format!("row-{id:010}"));
                (encode_key(id), Row { id, payload })
            })
            .collect();
        Self { rows }
    }

    pub fn get(&self, key: &Key) -> Option<&Row> {
        self.rows.get(key)
    }
}

pub fn encode_key(id: u64) -> Key {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

/// Builds the lookup run for every key of every scan.
///
/// Each call sleeps for `latency` to stand in for I/O. With `panic_every`
/// set, rows whose number is a multiple of it make the lookup panic.
pub fn index_lookup(index: Arc<Index>, latency: Duration, panic_every: usize) -> LookupFn<Row> {
    lookup_fn(move |key: &Key| {
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let row = index
            .get(key)
            .ok_or_else(|| LookupError::failed(format!("no row for key {key:?}")))?;
        if panic_every > 0 && row.id % panic_every as u64 == 0 {
            panic!("corrupt index entry for row {}", row.id);
        }
        Ok(row.clone())
    })
}

/// Samples `count` keys, a `miss_ratio` share of which are absent from an
/// index of `index_rows` rows.
pub fn sample_keys(index_rows: usize, count: usize, miss_ratio: f64) -> Vec<Key> {
    let mut rng = rng();
    (0..count)
        .map(|_| {
            if rng.random_bool(miss_ratio) {
                encode_key(index_rows as u64 + rng.random_range(0..u64::from(u32::MAX)))
            } else {
                encode_key(rng.random_range(0..index_rows as u64))
            }
        })
        .collect()
}

/// What one scan observed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub rows: u64,
    pub misses: u64,
    pub panics: u64,
    pub aborted: u64,
}

impl ScanReport {
    pub const fn total(&self) -> u64 {
        self.rows + self.misses + self.panics + self.aborted
    }

    fn merge(&mut self, other: &Self) {
        self.rows += other.rows;
        self.misses += other.misses;
        self.panics += other.panics;
        self.aborted += other.aborted;
    }
}

/// Runs one scan to end-of-stream and tallies its results.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if `cancel` fires first, or the submission
/// error if the pool refused the scan's keys.
pub async fn run_scan(
    dispatcher: &Dispatcher<Row>,
    keys: Vec<Key>,
    lookup: LookupFn<Row>,
    cancel: &CancellationToken,
) -> Result<ScanReport> {
    let mut scan = dispatcher.scan(keys, lookup, cancel.clone());
    let mut report = ScanReport::default();

    while let Some(result) = scan.next().await? {
        match result {
            Ok(_row) => report.rows += 1,
            Err(LookupError::Failed(_)) => report.misses += 1,
            Err(LookupError::Panicked { .. }) => report.panics += 1,
            Err(LookupError::Aborted { .. } | LookupError::PoolShutdown) => report.aborted += 1,
        }
    }

    scan.submitted().await?;
    Ok(report)
}

/// Aggregate of one round of concurrent scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundReport {
    pub scans: usize,
    pub failed_scans: usize,
    pub results: ScanReport,
    pub elapsed: Duration,
}

impl RoundReport {
    pub fn lookups_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.results.total() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Runs `config.concurrent_scans` scans at once over fresh key samples.
pub async fn run_round(
    dispatcher: &Dispatcher<Row>,
    lookup: &LookupFn<Row>,
    config: &WorkloadConfig,
    cancel: &CancellationToken,
) -> RoundReport {
    let start = Instant::now();
    let scans = (0..config.concurrent_scans).map(|_| {
        let keys = sample_keys(config.index_rows, config.keys_per_scan, config.miss_ratio);
        run_scan(dispatcher, keys, Arc::clone(lookup), cancel)
    });
    let outcomes = join_all(scans).await;

    let mut report = RoundReport {
        scans: outcomes.len(),
        ..RoundReport::default()
    };
    for outcome in &outcomes {
        match outcome {
            Ok(scan) => report.results.merge(scan),
            Err(Error::Cancelled) => report.failed_scans += 1,
            Err(_e) => {
                report.failed_scans += 1;
                #[cfg(feature = "tracing")]
                tracing::warn!("Scan failed: {_e}");
            }
        }
    }
    report.elapsed = start.elapsed();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowfetch::{PoolConfig, WorkerPool};

    fn workload(concurrent_scans: usize, keys_per_scan: usize) -> WorkloadConfig {
        WorkloadConfig {
            index_rows: 1_000,
            keys_per_scan,
            concurrent_scans,
            rounds: 1,
            lookup_latency: Duration::ZERO,
            miss_ratio: 0.0,
            panic_every: 0,
        }
    }

    #[test]
    fn sampled_keys_hit_the_index_without_misses() {
        let index = Index::build(50);
        let keys = sample_keys(50, 200, 0.0);
        assert_eq!(keys.len(), 200);
        assert!(keys.iter().all(|key| index.get(key).is_some()));
    }

    #[test]
    fn sampled_keys_all_miss_at_full_ratio() {
        let index = Index::build(50);
        let keys = sample_keys(50, 100, 1.0);
        assert!(keys.iter().all(|key| index.get(key).is_none()));
    }

    #[test]
    fn lookup_reports_missing_rows_as_errors() {
        let index = Arc::new(Index::build(10));
        let lookup = index_lookup(Arc::clone(&index), Duration::ZERO, 0);

        assert_eq!(lookup(&encode_key(3)).unwrap().id, 3);
        assert!(matches!(
            lookup(&encode_key(99)),
            Err(LookupError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn scan_counts_every_outcome() {
        let pool = WorkerPool::new(PoolConfig::with_workers(2)).unwrap();
        let index = Arc::new(Index::build(100));
        let lookup = index_lookup(index, Duration::ZERO, 7);

        // Rows 0, 7 and 14 panic; 500 misses.
        let keys: Vec<Key> = [0, 1, 7, 14, 20, 500].into_iter().map(encode_key).collect();
        let report = run_scan(&pool.dispatcher(), keys, lookup, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report,
            ScanReport {
                rows: 2,
                misses: 1,
                panics: 3,
                aborted: 0,
            }
        );
    }

    #[tokio::test]
    async fn round_fetches_every_sampled_key() {
        let pool = WorkerPool::new(PoolConfig::with_workers(4)).unwrap();
        let config = workload(6, 250);
        let lookup = index_lookup(Arc::new(Index::build(config.index_rows)), Duration::ZERO, 0);

        let report = run_round(&pool.dispatcher(), &lookup, &config, &CancellationToken::new()).await;
        assert_eq!(report.scans, 6);
        assert_eq!(report.failed_scans, 0);
        assert_eq!(report.results.rows, 6 * 250);
        assert_eq!(report.results.total(), 6 * 250);
    }

    #[tokio::test]
    async fn cancelled_round_fails_every_scan() {
        let pool = WorkerPool::new(PoolConfig::with_workers(1)).unwrap();
        let config = workload(3, 100);
        let lookup = index_lookup(Arc::new(Index::build(config.index_rows)), Duration::ZERO, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_round(&pool.dispatcher(), &lookup, &config, &cancel).await;
        assert_eq!(report.failed_scans, 3);
    }
}
