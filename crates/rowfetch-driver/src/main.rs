#![doc = include_str!("../README.md")]

mod config;
mod telemetry;
mod workload;

use clap::Parser;
use config::{CliArgs, DriverConfig};
use rowfetch::{CancellationToken, WorkerPool};
use std::sync::Arc;
use telemetry::init_telemetry;
use tokio::signal;
use workload::{Index, RoundReport, Row, index_lookup, run_round};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = DriverConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let pool = WorkerPool::<Row>::new(config.pool.clone())?;
    let index = Arc::new(Index::build(config.workload.index_rows));
    let lookup = index_lookup(
        index,
        config.workload.lookup_latency,
        config.workload.panic_every,
    );

    let cancel = CancellationToken::new();
    let dispatcher = pool.dispatcher();
    let mut faults = pool.faults();
    let workload = async {
        let mut round = 0;
        while config.workload.rounds == 0 || round < config.workload.rounds {
            round += 1;
            let report = run_round(&dispatcher, &lookup, &config.workload, &cancel).await;
            print_round(round, &report);
        }
    };

    tokio::select! {
        () = workload => {}
        () = shutdown_signal() => {
            #[cfg(feature = "tracing")]
            tracing::info!("Shutdown signal received, cancelling scans...");
            cancel.cancel();
        }
        fault = faults.wait_for(Option::is_some) => {
            if let Ok(_fault) = fault {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker pool faulted: {:?}", *_fault);
            }
        }
    }

    if let Err(_e) = pool.shutdown(config.shutdown_grace).await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during pool shutdown: {:?}", _e);
    }
    #[cfg(feature = "tracing")]
    tracing::info!("Driver shut down successfully");

    providers.shutdown();
    Ok(())
}

fn log_startup_info(_config: &DriverConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting lookup driver with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting lookup driver with {} workers, {} scans of {} keys per round",
            _config.pool.num_workers,
            _config.workload.concurrent_scans,
            _config.workload.keys_per_scan
        );
    }
}

fn print_round(round: usize, report: &RoundReport) {
    let results = &report.results;
    println!(
        "round {round}: {} scans ({} failed), {} rows, {} misses, {} panics, {} aborted in {:?} ({:.0} lookups/s)",
        report.scans,
        report.failed_scans,
        results.rows,
        results.misses,
        results.panics,
        results.aborted,
        report.elapsed,
        report.lookups_per_sec(),
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
}
