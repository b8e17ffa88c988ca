//! # Lookup keys, results and functions
//!
//! The pool treats keys and rows as opaque. A query engine plugs in by
//! supplying:
//!
//! - a [`Key`] per row to fetch (any byte encoding the engine likes), and
//! - a [`LookupFn`] that turns one key into one [`LookupResult`].
//!
//! The lookup function runs on a worker, off the scan's own task, and may be
//! invoked concurrently for keys of many scans. It must not assume anything
//! about the order in which keys are looked up or results are observed.

use crate::LookupError;
use std::sync::Arc;

/// Opaque lookup key. Cheap to clone; the pool never inspects its contents.
pub type Key = bytes::Bytes;

/// Outcome of a single lookup. Errors are data, not control flow.
pub type LookupResult<R> = Result<R, LookupError>;

/// A shareable function performing one lookup.
///
/// The function is synchronous and may block; workers run it on the blocking
/// thread pool.
pub type LookupFn<R> = Arc<dyn Fn(&Key) -> LookupResult<R> + Send + Sync>;

/// Wraps a closure as a [`LookupFn`].
pub fn lookup_fn<R, F>(f: F) -> LookupFn<R>
where
    F: Fn(&Key) -> LookupResult<R> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default number of buffered results on a sink's fast path.
pub const DEFAULT_SINK_CHANNEL_CAPACITY: usize = 128;

/// Default initial capacity of a sink's overflow backlog.
pub const DEFAULT_SINK_BACKLOG_CAPACITY: usize = 128;

/// Shared request queue slots per worker.
pub const QUEUE_SLOTS_PER_WORKER: usize = 256;
