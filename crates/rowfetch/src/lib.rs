#![doc = include_str!("../README.md")]

mod config;
pub mod pool;
mod request;
mod scan;
mod sink;
pub mod telemetry;

pub use config::PoolConfig;
pub use pool::{dispatcher::Dispatcher, manager::WorkerPool};
pub use request::LookupRequest;
pub use rowfetch_core::*;
pub use scan::LookupScan;
pub use sink::{ResultSink, SinkReader, SinkStats};
pub use tokio_util::sync::CancellationToken;
