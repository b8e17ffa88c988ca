//! Worker pool and submission.
//!
//! ## Structure
//!
//! - [`manager`] - the pool itself ([`WorkerPool`](manager::WorkerPool)):
//!   spawns workers, publishes faults, shuts down.
//! - [`dispatcher`] - the submission handle scans use to queue lookups.
//! - `worker` - the loop each worker runs.

pub mod dispatcher;
pub mod manager;
pub(crate) mod worker;

#[cfg(test)]
mod tests;
