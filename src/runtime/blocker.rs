//! Generic worker pool for calls that cannot be made non-blocking.
//!
//! A fixed number of plain OS threads pull jobs off a shared queue. Each job
//! is run, then told it is done, on the same worker thread. There is no
//! cooperative scheduling here; a job owns its worker until it returns.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A job for the worker pool.
pub trait BlockerJob: Send {
    /// Do the blocking work. Runs on a worker thread.
    fn run(&mut self);

    /// Completion callback, invoked on the same worker right after `run`.
    fn done(self: Box<Self>);
}

type Job = Box<dyn BlockerJob>;

pub struct BlockerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl BlockerPool {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("blocker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))?;
            workers.push(handle);
        }

        info!(workers = size, "Blocker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Queue a job. Hands the job back if the pool has been shut down.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop accepting jobs, let queued ones finish and join every worker.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("Blocker thread panicked");
            }
        }
        info!("Blocker pool stopped");
    }
}

impl Drop for BlockerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Job>) {
    debug!(worker = worker_id, "Blocker thread started");
    for mut job in receiver.iter() {
        job.run();
        job.done();
    }
    debug!(worker = worker_id, "Blocker thread exiting");
}
