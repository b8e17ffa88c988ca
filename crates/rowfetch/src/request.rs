use crate::sink::ResultSink;
use rowfetch_core::{Key, LookupFn};
use std::sync::Arc;

/// One key to look up, the function that looks it up, and the sink its
/// result goes to.
///
/// Requests are immutable. The dispatcher owns one until it is queued; the
/// worker that dequeues it consumes it. The request keeps its sink alive, so
/// a result can always be written even after the scan stopped reading.
pub struct LookupRequest<R> {
    key: Key,
    lookup: LookupFn<R>,
    sink: Arc<ResultSink<R>>,
}

impl<R> LookupRequest<R> {
    pub const fn new(key: Key, lookup: LookupFn<R>, sink: Arc<ResultSink<R>>) -> Self {
        Self { key, lookup, sink }
    }

    pub const fn key(&self) -> &Key {
        &self.key
    }

    pub const fn sink(&self) -> &Arc<ResultSink<R>> {
        &self.sink
    }

    pub fn into_parts(self) -> (Key, LookupFn<R>, Arc<ResultSink<R>>) {
        (self.key, self.lookup, self.sink)
    }
}

impl<R> core::fmt::Debug for LookupRequest<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LookupRequest")
            .field("key", &self.key)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}
