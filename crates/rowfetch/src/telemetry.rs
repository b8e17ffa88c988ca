//! Pool metrics.
//!
//! With the `metrics` feature enabled, workers and sinks record OpenTelemetry
//! instruments through handles installed by [`init_metric_handles`]. Until the
//! handles are installed, and always when the feature is off, every recording
//! function is a no-op.
//!
//! Instruments:
//!
//! - `lookups_enqueued`: requests accepted onto the shared queue
//! - `lookups_completed`: results written back to a sink
//! - `lookup_failures`: results carrying a lookup error (panics included)
//! - `lookup_panics`: lookups that panicked inside a worker
//! - `backlog_spills`: results diverted to a sink backlog
//! - `sink_faults`: writes rejected by a sink
//! - `lookup_duration`: wall time of one lookup, in milliseconds

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
static LOOKUPS_ENQUEUED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LOOKUPS_COMPLETED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LOOKUP_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LOOKUP_PANICS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static BACKLOG_SPILLS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SINK_FAULTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LOOKUP_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

/// Installs the instrument handles. Later calls are ignored.
#[cfg(feature = "metrics")]
pub fn init_metric_handles(meter: &Meter) {
    let _ = LOOKUPS_ENQUEUED.set(
        meter
            .u64_counter("lookups_enqueued")
            .with_description("Lookup requests accepted onto the shared queue")
            .build(),
    );

    let _ = LOOKUPS_COMPLETED.set(
        meter
            .u64_counter("lookups_completed")
            .with_description("Lookup results written to a sink")
            .build(),
    );

    let _ = LOOKUP_FAILURES.set(
        meter
            .u64_counter("lookup_failures")
            .with_description("Lookup results carrying an error")
            .build(),
    );

    let _ = LOOKUP_PANICS.set(
        meter
            .u64_counter("lookup_panics")
            .with_description("Lookups that panicked inside a worker")
            .build(),
    );

    let _ = BACKLOG_SPILLS.set(
        meter
            .u64_counter("backlog_spills")
            .with_description("Results diverted to a sink backlog")
            .build(),
    );

    let _ = SINK_FAULTS.set(
        meter
            .u64_counter("sink_faults")
            .with_description("Writes rejected by a sink")
            .build(),
    );

    let _ = LOOKUP_DURATION_MS.set(
        meter
            .f64_histogram("lookup_duration")
            .with_unit("ms")
            .with_description("Wall time of a single lookup")
            .build(),
    );
}

#[cfg(feature = "metrics")]
fn add(counter: &OnceLock<Counter<u64>>, value: u64) {
    if let Some(counter) = counter.get() {
        counter.add(value, &[]);
    }
}

#[cfg(feature = "metrics")]
pub fn increment_lookups_enqueued() {
    add(&LOOKUPS_ENQUEUED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_lookups_enqueued() {}

#[cfg(feature = "metrics")]
pub fn increment_lookups_completed() {
    add(&LOOKUPS_COMPLETED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_lookups_completed() {}

#[cfg(feature = "metrics")]
pub fn increment_lookup_failures() {
    add(&LOOKUP_FAILURES, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_lookup_failures() {}

#[cfg(feature = "metrics")]
pub fn increment_lookup_panics() {
    add(&LOOKUP_PANICS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_lookup_panics() {}

#[cfg(feature = "metrics")]
pub fn increment_backlog_spills() {
    add(&BACKLOG_SPILLS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_backlog_spills() {}

#[cfg(feature = "metrics")]
pub fn increment_sink_faults() {
    add(&SINK_FAULTS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_sink_faults() {}

#[cfg(feature = "metrics")]
pub fn record_lookup_duration(duration_ms: f64) {
    if let Some(histogram) = LOOKUP_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_lookup_duration(_duration_ms: f64) {}
