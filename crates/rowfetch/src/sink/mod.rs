//! Per-scan result sinks.
//!
//! A sink is the meeting point between the workers producing results for one
//! scan and the scan consuming them. It has two delivery paths:
//!
//! - a bounded channel, the fast path, used whenever it has room;
//! - an unbounded FIFO backlog, used when the channel is full so that a
//!   worker never waits on a slow consumer.
//!
//! Completion is decided by a single countdown. It starts at one (the
//! submission guard), grows by one per marked submission, shrinks by one per
//! write, and drops the guard when the final submission is marked. Whichever
//! call takes it to zero fires the completion token, so completion happens
//! exactly once and only after every submitted key has been written.
//!
//! A write first claims one of the marked submissions. A write with nothing
//! left to claim is refused before delivery, so it can neither reach the
//! reader nor consume the guard.
//!
//! The writer side, [`ResultSink`], is shared behind an [`Arc`] by every
//! outstanding request. The reader side, [`SinkReader`], is owned by the scan.

mod reader;

pub use reader::SinkReader;

use crate::telemetry::increment_backlog_spills;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use rowfetch_core::{Error, LookupResult, Result, SinkFault, panic_message};
use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Writer side of a per-scan result sink.
pub struct ResultSink<R> {
    tx: mpsc::Sender<LookupResult<R>>,
    backlog: Mutex<VecDeque<LookupResult<R>>>,
    /// Submissions marked plus the guard, minus writes.
    pending: AtomicU64,
    submitted: AtomicU64,
    /// Writes that claimed a marked submission. Never exceeds `submitted`.
    completed_writes: AtomicU64,
    submission_done: AtomicBool,
    completed: CancellationToken,
}

/// Point-in-time counters of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkStats {
    pub submitted: u64,
    pub completed_writes: u64,
    pub submission_done: bool,
    pub backlog_len: usize,
    pub is_complete: bool,
}

impl<R> ResultSink<R> {
    /// Creates a sink and its single reader.
    ///
    /// A `channel_capacity` of zero is raised to one.
    pub fn channel(channel_capacity: usize, backlog_capacity: usize) -> (Arc<Self>, SinkReader<R>) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let sink = Arc::new(Self {
            tx,
            backlog: Mutex::new(VecDeque::with_capacity(backlog_capacity)),
            pending: AtomicU64::new(1),
            submitted: AtomicU64::new(0),
            completed_writes: AtomicU64::new(0),
            submission_done: AtomicBool::new(false),
            completed: CancellationToken::new(),
        });
        let reader = SinkReader::new(rx, Arc::clone(&sink));
        (sink, reader)
    }

    /// Records one more submission for this sink. With `is_final`, also
    /// freezes the submission count.
    ///
    /// Must be called before the matching request can reach a worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionSealed`] if the final submission was already
    /// recorded. Nothing is counted in that case.
    pub fn mark_submission(&self, is_final: bool) -> Result<()> {
        if self.submission_done.load(Ordering::Acquire) {
            return Err(Error::SubmissionSealed);
        }

        // `pending` first: a write may claim the submission as soon as
        // `submitted` shows it.
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::AcqRel);

        if is_final {
            self.seal()?;
        }
        Ok(())
    }

    /// Marks submission done without adding a submission.
    ///
    /// A sink sealed with no submissions completes immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionSealed`] if submission was already done.
    pub fn seal(&self) -> Result<()> {
        if self.submission_done.swap(true, Ordering::AcqRel) {
            return Err(Error::SubmissionSealed);
        }

        // Writes never claim the guard, so this unit is still there.
        self.release();
        Ok(())
    }

    /// Delivers one result without waiting.
    ///
    /// Tries the channel first and falls back to the backlog when the channel
    /// is full. If the reader is gone the result is dropped. The write is
    /// counted either way.
    ///
    /// The submission must be marked before its result is written.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFault::UnexpectedWrite`] if every marked submission
    /// already has its result. Nothing is delivered in that case.
    pub fn write(&self, result: LookupResult<R>) -> core::result::Result<(), SinkFault> {
        self.claim_submission()?;

        match self.tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                self.backlog.lock().push_back(result);
                increment_backlog_spills();
            }
            Err(TrySendError::Closed(_)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Sink reader dropped, discarding result");
            }
        }

        // Released only after delivery so completion never outruns the
        // result it accounts for.
        self.release();
        Ok(())
    }

    /// [`write`](Self::write) with fault containment: a panic while writing
    /// is captured and returned as a [`SinkFault`] instead of unwinding into
    /// the caller.
    pub fn safe_write(&self, result: LookupResult<R>) -> core::result::Result<(), SinkFault> {
        match catch_unwind(AssertUnwindSafe(|| self.write(result))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(SinkFault::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Returns `true` once every submitted result has been written and
    /// submission is done.
    pub fn is_complete(&self) -> bool {
        self.completed.is_cancelled()
    }

    /// Returns `true` once the final submission has been marked.
    pub fn is_sealed(&self) -> bool {
        self.submission_done.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            submitted: self.submitted.load(Ordering::Acquire),
            completed_writes: self.completed_writes.load(Ordering::Acquire),
            submission_done: self.submission_done.load(Ordering::Acquire),
            backlog_len: self.backlog.lock().len(),
            is_complete: self.is_complete(),
        }
    }

    /// Counts one write against the marked submissions.
    fn claim_submission(&self) -> core::result::Result<(), SinkFault> {
        self.completed_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |written| {
                (written < self.submitted.load(Ordering::Acquire)).then_some(written + 1)
            })
            .map(|_| ())
            .map_err(|written| SinkFault::UnexpectedWrite {
                submitted: self.submitted.load(Ordering::Acquire),
                completed: written + 1,
            })
    }

    /// Takes one unit off the countdown, firing completion on the last one.
    fn release(&self) {
        let released = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released == Ok(1) {
            self.completed.cancel();
        }
    }

    fn pop_backlog(&self) -> Option<LookupResult<R>> {
        self.backlog.lock().pop_front()
    }
}

impl<R> core::fmt::Debug for ResultSink<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResultSink")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
