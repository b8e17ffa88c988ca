use super::ResultSink;
use rowfetch_core::{Error, LookupResult, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Consumer side of a result sink. There is exactly one per sink.
pub struct SinkReader<R> {
    rx: mpsc::Receiver<LookupResult<R>>,
    sink: Arc<ResultSink<R>>,
}

impl<R> SinkReader<R> {
    pub(super) fn new(rx: mpsc::Receiver<LookupResult<R>>, sink: Arc<ResultSink<R>>) -> Self {
        Self { rx, sink }
    }

    /// Waits for the next result.
    ///
    /// Returns `Ok(Some(result))` for each written result and `Ok(None)` once
    /// every submitted result has been returned. Results come back in
    /// completion order.
    ///
    /// While the sink is incomplete this waits on the channel only. Once it
    /// completes, whatever is left in the channel is returned first, then the
    /// backlog in the order it was written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires, even if results
    /// are still buffered.
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<LookupResult<R>>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            Some(result) = self.rx.recv() => return Ok(Some(result)),
            () = self.sink.completed.cancelled() => {}
        }

        if let Ok(result) = self.rx.try_recv() {
            return Ok(Some(result));
        }
        Ok(self.sink.pop_backlog())
    }

    /// The writer side this reader drains.
    pub const fn sink(&self) -> &Arc<ResultSink<R>> {
        &self.sink
    }
}

impl<R> core::fmt::Debug for SinkReader<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SinkReader")
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}
