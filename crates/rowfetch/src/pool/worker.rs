use crate::{
    request::LookupRequest,
    telemetry::{
        increment_lookup_failures, increment_lookup_panics, increment_lookups_completed,
        increment_sink_faults, record_lookup_duration,
    },
};
use rowfetch_core::{LookupError, LookupResult, PoolFault};
use std::{sync::Arc, time::Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Receiving end of the shared request queue, shared by every worker.
pub(crate) type SharedQueue<R> = Arc<Mutex<mpsc::Receiver<LookupRequest<R>>>>;

/// Slot holding the first fault published by any worker.
pub(crate) type FaultSlot = Arc<watch::Sender<Option<PoolFault>>>;

/// Worker task draining the shared request queue.
///
/// Each pass moves through `Idle -> Dequeuing -> Executing -> Writing` and
/// back to `Idle`. The loop only ends when the queue yields nothing more:
///
/// - after `shutdown` fires, once the requests already queued are drained;
/// - otherwise the queue was closed under a running pool. That is published as
///   [`PoolFault::QueueClosed`] so the owner can react, since every later
///   submission would wait forever.
///
/// # Arguments
///
/// - `worker_id`: Identifier for this worker, used in logs and faults.
/// - `queue`: The shared request queue.
/// - `shutdown`: Pool shutdown token.
/// - `faults`: Where a fatal fault is published.
pub(crate) async fn worker_loop<R>(
    worker_id: usize,
    queue: SharedQueue<R>,
    shutdown: CancellationToken,
    faults: FaultSlot,
) where
    R: Send + 'static,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(request) = next_request(&queue, &shutdown).await {
        process_request(worker_id, request).await;
    }

    if shutdown.is_cancelled() {
        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {worker_id} stopped");
        return;
    }

    let fault = PoolFault::QueueClosed { worker_id };
    #[cfg(feature = "tracing")]
    tracing::error!("{fault}; all further lookups would hang");

    faults.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(fault);
            true
        } else {
            false
        }
    });
}

/// Takes the next request off the shared queue.
///
/// Once shutdown fires the queue is closed to new requests; buffered ones are
/// still handed out until it is empty.
async fn next_request<R>(
    queue: &Mutex<mpsc::Receiver<LookupRequest<R>>>,
    shutdown: &CancellationToken,
) -> Option<LookupRequest<R>> {
    let mut rx = queue.lock().await;
    tokio::select! {
        biased;
        request = rx.recv() => request,
        () = shutdown.cancelled() => {
            rx.close();
            rx.recv().await
        }
    }
}

/// Runs one lookup and writes its outcome to the request's sink.
///
/// The lookup runs on the blocking pool. A panic inside it comes back as a
/// [`JoinError`](tokio::task::JoinError) and is turned into an error result
/// for this key only.
async fn process_request<R>(_worker_id: usize, request: LookupRequest<R>)
where
    R: Send + 'static,
{
    let (key, lookup, sink) = request.into_parts();
    let start = Instant::now();

    let result: LookupResult<R> = match tokio::task::spawn_blocking(move || lookup(&key)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let err = LookupError::from_panic(e.into_panic().as_ref());
            increment_lookup_panics();
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {_worker_id} contained a lookup panic: {err}");
            Err(err)
        }
        Err(e) => Err(LookupError::Aborted {
            reason: e.to_string(),
        }),
    };

    record_lookup_duration(start.elapsed().as_secs_f64() * 1000.0);
    if result.is_err() {
        increment_lookup_failures();
    }

    match sink.safe_write(result) {
        Ok(()) => increment_lookups_completed(),
        Err(_fault) => {
            increment_sink_faults();
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {_worker_id} failed to write result: {_fault}");
        }
    }
}
