//! coropool: token-ring demo over the coroutine thread pool.
//!
//! Starts the configured number of event-loop threads, then passes a token
//! around them. Every hop runs a blocking sleep on the blocker pool from a
//! coroutine. Ctrl-C delivers the interrupt message, which shuts the pool
//! down.

mod demo;

use coropool::config::Config;
use coropool::ThreadPool;
use demo::Ring;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        threads = config.threads,
        blocker_threads = config.blocker_threads,
        stats_interval = ?config.stats_interval,
        handle_signals = config.handle_signals,
        hops = config.hops,
        hop_delay = ?config.hop_delay,
        "Starting coropool"
    );

    let pool = ThreadPool::with_options(config.pool_options())?;
    let ring = Ring {
        hops: config.hops,
        hop_delay: config.hop_delay,
    };
    pool.run(Box::new(move || demo::start(ring)));

    info!("coropool exited");
    Ok(())
}
