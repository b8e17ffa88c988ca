use crate::{
    request::LookupRequest,
    scan::LookupScan,
    sink::{ResultSink, SinkReader},
    telemetry::increment_lookups_enqueued,
};
use rowfetch_core::{Error, Key, LookupError, LookupFn, PoolFault, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Submission handle for a [`WorkerPool`](crate::WorkerPool).
///
/// Cheap to clone; every scan can hold its own.
pub struct Dispatcher<R> {
    queue: mpsc::Sender<LookupRequest<R>>,
    shutdown_token: CancellationToken,
    faults: watch::Receiver<Option<PoolFault>>,
    sink_channel_capacity: usize,
    sink_backlog_capacity: usize,
}

impl<R> Clone for Dispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            shutdown_token: self.shutdown_token.clone(),
            faults: self.faults.clone(),
            sink_channel_capacity: self.sink_channel_capacity,
            sink_backlog_capacity: self.sink_backlog_capacity,
        }
    }
}

impl<R> Dispatcher<R> {
    pub(crate) const fn new(
        queue: mpsc::Sender<LookupRequest<R>>,
        shutdown_token: CancellationToken,
        faults: watch::Receiver<Option<PoolFault>>,
        sink_channel_capacity: usize,
        sink_backlog_capacity: usize,
    ) -> Self {
        Self {
            queue,
            shutdown_token,
            faults,
            sink_channel_capacity,
            sink_backlog_capacity,
        }
    }

    /// Creates a result sink sized from the pool config, for one scan.
    pub fn sink(&self) -> (Arc<ResultSink<R>>, SinkReader<R>) {
        ResultSink::channel(self.sink_channel_capacity, self.sink_backlog_capacity)
    }

    /// Queues a lookup of `key` whose result goes to `sink`.
    ///
    /// The submission is marked on the sink first, then the request is pushed
    /// onto the shared queue. This waits only while the queue is full.
    ///
    /// Pass `is_final = true` on the last key for this sink.
    ///
    /// # Errors
    ///
    /// - [`Error::SubmissionSealed`] if the sink already received its final
    ///   submission. Nothing is queued.
    /// - [`Error::PoolShutdown`] or [`Error::PoolFaulted`] if the pool stopped
    ///   accepting work. The key still gets a
    ///   [`LookupError::PoolShutdown`] result on the sink, so the scan sees
    ///   one result per submitted key.
    pub async fn enqueue(
        &self,
        key: Key,
        lookup: LookupFn<R>,
        sink: &Arc<ResultSink<R>>,
        is_final: bool,
    ) -> Result<()> {
        sink.mark_submission(is_final)?;
        let mut guard = SubmissionGuard::new(sink);
        let request = LookupRequest::new(key, lookup, Arc::clone(sink));

        let permit = if self.ensure_accepting().is_ok() {
            tokio::select! {
                biased;
                permit = self.queue.reserve() => permit.ok(),
                () = self.shutdown_token.cancelled() => None,
            }
        } else {
            None
        };

        if let Some(permit) = permit {
            permit.send(request);
            guard.disarm();
            increment_lookups_enqueued();
            return Ok(());
        }

        guard.fail(LookupError::PoolShutdown);
        Err(match self.ensure_accepting() {
            Err(e) => e,
            Ok(()) => Error::ChannelError {
                context: "request queue closed".to_string(),
            },
        })
    }

    /// Fails if the pool is shutting down or has faulted.
    fn ensure_accepting(&self) -> Result<()> {
        if let Some(fault) = *self.faults.borrow() {
            return Err(Error::PoolFaulted { fault });
        }
        if self.shutdown_token.is_cancelled() {
            return Err(Error::PoolShutdown);
        }
        Ok(())
    }

    /// Subscribes to fatal pool faults.
    pub fn faults(&self) -> watch::Receiver<Option<PoolFault>> {
        self.faults.clone()
    }
}

impl<R> Dispatcher<R>
where
    R: Send + 'static,
{
    /// Starts an index lookup scan over `keys`.
    ///
    /// Keys are submitted from a background task while the returned scan
    /// reads, so a long key list never waits on the caller. `cancel` stops
    /// both reading and further submission.
    pub fn scan<I>(&self, keys: I, lookup: LookupFn<R>, cancel: CancellationToken) -> LookupScan<R>
    where
        I: IntoIterator<Item = Key>,
        I::IntoIter: Send + 'static,
    {
        LookupScan::start(self.clone(), keys.into_iter(), lookup, cancel)
    }
}

impl<R> core::fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_capacity", &self.queue.max_capacity())
            .field("sink_channel_capacity", &self.sink_channel_capacity)
            .field("sink_backlog_capacity", &self.sink_backlog_capacity)
            .finish_non_exhaustive()
    }
}

/// Keeps the one-result-per-submission promise for a key that was marked on
/// its sink but never queued, including when the `enqueue` future is dropped
/// while waiting for queue space.
struct SubmissionGuard<'a, R> {
    sink: &'a ResultSink<R>,
    armed: bool,
}

impl<'a, R> SubmissionGuard<'a, R> {
    const fn new(sink: &'a ResultSink<R>) -> Self {
        Self { sink, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn fail(&mut self, err: LookupError) {
        if core::mem::replace(&mut self.armed, false) {
            if let Err(_fault) = self.sink.safe_write(Err(err)) {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to record unqueued lookup: {_fault}");
            }
        }
    }
}

impl<R> Drop for SubmissionGuard<'_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.fail(LookupError::Aborted {
            reason: "submission dropped before it was queued".to_string(),
        });
    }
}
