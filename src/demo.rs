//! Token ring: a token hops from thread to thread, each hop paying for one
//! bridged blocking sleep, until the hop limit or Ctrl-C.

use coropool::{current_pool, current_thread_id, run_blocking, spawn, PoolHandle};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct Ring {
    /// Stop after this many hops, 0 runs until interrupted.
    pub hops: u64,
    pub hop_delay: Duration,
}

/// Initial message body: arm the interrupt and put the token on this thread.
pub fn start(ring: Ring) {
    let Some(pool) = current_pool() else {
        warn!("Token ring started off the pool");
        return;
    };

    let started = Instant::now();
    pool.set_interrupt_message(Some(Box::new(move || {
        info!(elapsed = ?started.elapsed(), "Interrupted, stopping token ring");
        if let Some(pool) = current_pool() {
            pool.shutdown();
        }
    })));

    info!(
        threads = pool.n_threads(),
        hops = ring.hops,
        hop_delay = ?ring.hop_delay,
        "Token ring started"
    );
    hop(ring, 0);
}

/// Runs on the thread currently holding the token.
fn hop(ring: Ring, count: u64) {
    spawn(async move {
        let delay = ring.hop_delay;
        run_blocking(move || thread::sleep(delay)).await;

        let (Some(pool), Some(here)) = (current_pool(), current_thread_id()) else {
            return;
        };
        let count = count + 1;
        debug!(thread = here, hop = count, "Token held");

        if ring.hops != 0 && count >= ring.hops {
            info!(hops = count, "Token ring finished");
            pool.shutdown();
            return;
        }
        if count % 100 == 0 {
            info!(hops = count, "Token ring progress");
        }

        pass(&pool, here, ring, count);
    });
}

fn pass(pool: &PoolHandle, here: usize, ring: Ring, count: u64) {
    let next = next_thread(here, pool.n_threads());
    if let Err(e) = pool.send(next, Box::new(move || hop(ring, count))) {
        // Only a stopping pool refuses messages.
        debug!(thread = next, error = %e, "Token dropped");
    }
}

fn next_thread(here: usize, n_threads: usize) -> usize {
    (here + 1) % n_threads
}
