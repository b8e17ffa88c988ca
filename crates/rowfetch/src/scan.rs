//! Index lookup scans.
//!
//! A [`LookupScan`] is what an index row iterator holds: it owns the sink
//! reader for one scan and a background task that feeds the scan's keys to the
//! pool. Rows come back as they complete, through [`LookupScan::next`] or as a
//! [`Stream`].

use crate::{Dispatcher, sink::ResultSink, sink::SinkReader};
use futures::Stream;
use rowfetch_core::{Error, Key, LookupFn, LookupResult, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An in-progress lookup of a sequence of keys.
///
/// Dropping the scan cancels it: no further keys are submitted and lookups
/// already running finish into a sink nobody reads.
pub struct LookupScan<R> {
    reader: SinkReader<R>,
    cancel: CancellationToken,
    submitter: Option<JoinHandle<Result<u64>>>,
}

impl<R> LookupScan<R>
where
    R: Send + 'static,
{
    pub(crate) fn start<I>(
        dispatcher: Dispatcher<R>,
        keys: I,
        lookup: LookupFn<R>,
        cancel: CancellationToken,
    ) -> Self
    where
        I: Iterator<Item = Key> + Send + 'static,
    {
        let cancel = cancel.child_token();
        let (sink, reader) = dispatcher.sink();
        let fut = submit_keys(dispatcher, keys, lookup, sink, cancel.clone());
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::debug_span!("lookup_scan"))
        };
        let submitter = tokio::spawn(fut);

        Self {
            reader,
            cancel,
            submitter: Some(submitter),
        }
    }
}

impl<R> LookupScan<R> {
    /// Returns the next completed lookup, or `None` once every submitted key
    /// has produced its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`](rowfetch_core::Error::Cancelled) once the
    /// scan is cancelled.
    pub async fn next(&mut self) -> Result<Option<LookupResult<R>>> {
        self.reader.read(&self.cancel).await
    }

    /// Stops the scan. The next read fails with
    /// [`Error::Cancelled`](rowfetch_core::Error::Cancelled).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The sink this scan reads from.
    pub const fn sink(&self) -> &Arc<ResultSink<R>> {
        self.reader.sink()
    }

    /// Waits for the submission task and returns how many keys it queued.
    ///
    /// # Errors
    ///
    /// Returns the first submission error, e.g.
    /// [`Error::PoolShutdown`](rowfetch_core::Error::PoolShutdown).
    pub async fn submitted(&mut self) -> Result<u64> {
        let Some(handle) = self.submitter.take() else {
            return Ok(self.sink().stats().submitted);
        };
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::ChannelError {
                context: format!("submission task failed: {e}"),
            }),
        }
    }

    /// Turns the scan into a stream of results.
    ///
    /// The stream ends at end-of-stream. On cancellation it yields a single
    /// `Err(Error::Cancelled)` and ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<LookupResult<R>>> {
        futures::stream::unfold(Some(self), |scan| async move {
            let mut scan = scan?;
            match scan.next().await {
                Ok(Some(result)) => Some((Ok(result), Some(scan))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<R> Drop for LookupScan<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<R> core::fmt::Debug for LookupScan<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LookupScan")
            .field("reader", &self.reader)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Feeds `keys` to the pool, flagging the last one as final.
///
/// Cancellation also interrupts a key waiting for queue space; that key gets
/// an aborted result.
///
/// The sink is always sealed on the way out, whether every key was queued,
/// there were none, the scan was cancelled or the pool refused a key. The
/// reader therefore always reaches end-of-stream once the queued lookups
/// finish.
async fn submit_keys<R, I>(
    dispatcher: Dispatcher<R>,
    keys: I,
    lookup: LookupFn<R>,
    sink: Arc<ResultSink<R>>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: Send + 'static,
    I: Iterator<Item = Key>,
{
    let mut keys = keys.peekable();
    let mut submitted = 0;

    let outcome = loop {
        let Some(key) = keys.next() else {
            break Ok(submitted);
        };

        let is_final = keys.peek().is_none();
        let enqueued = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = dispatcher.enqueue(key, Arc::clone(&lookup), &sink, is_final) => Some(res),
        };

        match enqueued {
            Some(Ok(())) => submitted += 1,
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Scan submission stopped after {submitted} keys: {e}");
                break Err(e);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Scan cancelled after submitting {submitted} keys");
                break Ok(submitted);
            }
        }
    };

    // A final key, even an aborted one, has already sealed the sink.
    match sink.seal() {
        Ok(()) | Err(Error::SubmissionSealed) => {}
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to seal scan sink: {_e}");
        }
    }
    outcome
}
