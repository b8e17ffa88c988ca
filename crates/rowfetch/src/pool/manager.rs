//! The shared lookup worker pool.
//!
//! This module defines [`WorkerPool`], which owns a fixed set of tokio worker
//! tasks draining one shared, bounded request queue. Every scan submits
//! through a [`Dispatcher`] cloned from the pool, so independent scans
//! compete for the same workers in plain FIFO order.
//!
//! The pool is an ordinary value: the query engine builds one and hands out
//! dispatchers. Tests build small ones with a handful of workers.

use super::{
    dispatcher::Dispatcher,
    worker::{FaultSlot, worker_loop},
};
use crate::config::PoolConfig;
use core::time::Duration;
use parking_lot::Mutex;
use rowfetch_core::{Error, PoolFault, Result};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// A fixed-size pool of lookup workers sharing one bounded request queue.
pub struct WorkerPool<R> {
    config: PoolConfig,
    dispatcher: Dispatcher<R>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    faults: watch::Receiver<Option<PoolFault>>,
}

impl<R> WorkerPool<R>
where
    R: Send + 'static,
{
    /// Validates `config`, creates the shared queue and spawns
    /// `config.num_workers` workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the config is rejected or no tokio
    /// runtime is running.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::InvalidConfig {
            reason: format!("worker pool needs a tokio runtime: {e}"),
        })?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let queue = Arc::new(tokio::sync::Mutex::new(rx));
        let shutdown_token = CancellationToken::new();
        let (fault_tx, faults) = watch::channel(None);
        let fault_tx: FaultSlot = Arc::new(fault_tx);

        let workers = (0..config.num_workers)
            .map(|worker_id| {
                runtime.spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue),
                    shutdown_token.clone(),
                    Arc::clone(&fault_tx),
                ))
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Started {} lookup workers (queue capacity {})",
            config.num_workers,
            config.queue_capacity
        );

        let dispatcher = Dispatcher::new(
            tx,
            shutdown_token.clone(),
            faults.clone(),
            config.sink_channel_capacity,
            config.sink_backlog_capacity,
        );

        Ok(Self {
            config,
            dispatcher,
            shutdown_token,
            workers: Mutex::new(workers),
            faults,
        })
    }

    /// Returns a submission handle for this pool.
    pub fn dispatcher(&self) -> Dispatcher<R> {
        self.dispatcher.clone()
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribes to fatal pool faults. The value is `None` while the pool is
    /// healthy and holds the first published fault afterwards.
    pub fn faults(&self) -> watch::Receiver<Option<PoolFault>> {
        self.faults.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts the pool down.
    ///
    /// - Stops accepting new requests; submitters get
    ///   [`Error::PoolShutdown`].
    /// - Lets workers drain requests that were already queued, so every
    ///   accepted key still gets its result.
    /// - Waits up to `grace` for all workers to finish. Workers still busy
    ///   after that keep running detached.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        // === Phase 1: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new lookups");
        self.shutdown_token.cancel();

        // === Phase 2: Wait for workers to drain the queue ===
        let handles = core::mem::take(&mut *self.workers.lock());
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Waiting up to {:?} for {} workers to drain",
            grace,
            handles.len()
        );

        match timeout(grace, futures::future::join_all(handles)).await {
            Ok(_results) => {
                #[cfg(feature = "tracing")]
                for (_i, res) in _results.iter().enumerate() {
                    if let Err(_e) = res {
                        tracing::error!("Worker {_i} ended abnormally: {_e}");
                    }
                }
                #[cfg(feature = "tracing")]
                tracing::info!("Worker pool shutdown complete");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker pool drain timed out after {:?}", grace);
            }
        }

        Ok(())
    }
}

impl<R> core::fmt::Debug for WorkerPool<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .field("fault", &*self.faults.borrow())
            .finish_non_exhaustive()
    }
}
