//! Error types for the lookup pool.
//!
//! Four families of failure exist and they do not mix:
//!
//! - [`Error`]: returned by the submission and consumption APIs themselves
//!   (a cancelled read, a sealed sink, a pool that stopped accepting work).
//! - [`LookupError`]: the error half of a single lookup result. These are
//!   data: they travel through a result sink like any row and the consumer
//!   inspects each one.
//! - [`SinkFault`]: a diagnostic produced when writing a result into a sink
//!   goes wrong. Workers log it and move on.
//! - [`PoolFault`]: a fatal condition inside the worker pool, published to the
//!   owner of the pool instead of being raised as a panic.

use core::any::Any;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for submission and consumption.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The reader's cancellation token fired before a result was available.
    #[error("Read cancelled")]
    Cancelled,

    /// A submission was marked on a sink whose final submission was already
    /// recorded.
    #[error("Sink already received its final submission")]
    SubmissionSealed,

    /// The pool is shutting down and no longer accepts requests.
    #[error("Worker pool is shutting down")]
    PoolShutdown,

    /// A worker published a fatal fault; no further work is accepted.
    #[error("Worker pool faulted: {fault}")]
    PoolFaulted { fault: PoolFault },

    /// Pool or sink configuration was rejected.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Internal channel failure between a scan and the pool.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

/// Failure of a single lookup, delivered to the consumer as data.
#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    /// The lookup function returned an error.
    #[error("Lookup failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The lookup function panicked. The panic was contained to this key.
    #[error("Lookup panicked: {message}")]
    Panicked { message: String },

    /// The lookup task never completed, e.g. because the runtime shut down.
    #[error("Lookup aborted: {reason}")]
    Aborted { reason: String },

    /// The pool shut down before the request reached a worker.
    #[error("Worker pool shut down before the lookup ran")]
    PoolShutdown,
}

impl LookupError {
    /// Wraps any error produced by a lookup function.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Failed(err.into())
    }

    /// Converts a panic payload into an error-bearing result.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            message: panic_message(payload),
        }
    }

    /// Returns `true` if the lookup function panicked.
    pub const fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

/// A write into a result sink that could not be applied cleanly.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum SinkFault {
    /// More results were written than submissions were marked.
    #[error("Unexpected write: {completed} results for {submitted} submissions")]
    UnexpectedWrite { submitted: u64, completed: u64 },

    /// Writing panicked; the payload was captured.
    #[error("Write panicked: {message}")]
    Panicked { message: String },
}

/// Fatal conditions observed inside the worker pool.
#[derive(Clone, Copy, thiserror::Error, Debug, PartialEq, Eq)]
pub enum PoolFault {
    /// A worker found the shared request queue closed while the pool was
    /// still meant to be running. Every later submission would hang.
    #[error("Request queue closed under worker {worker_id}")]
    QueueClosed { worker_id: usize },
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
