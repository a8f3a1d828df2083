use crossbeam_channel::{Receiver, Sender};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Fixed set of OS threads that run blocking jobs pulled from a shared queue.
///
/// Jobs never run on the async executor's threads. Closing the pool stops
/// intake; jobs already queued still run before the threads exit.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fiberkv-worker-{index}"))
                .spawn(move || worker_loop(index, receiver))?;
            handles.push(handle);
        }
        debug!(size, "worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| PoolError::Closed)?
            .as_ref()
            .cloned()
            .ok_or(PoolError::Closed)?;
        sender.send(job).map_err(|_| PoolError::Closed)
    }

    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if sender.take().is_some() {
                debug!(size = self.size, "worker pool closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .map(|sender| sender.is_none())
            .unwrap_or(true)
    }

    /// Closes the pool and blocks until every worker has exited. Call only from
    /// synchronous code.
    pub fn join(&self) {
        self.close();
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(index: usize, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(worker = index, "job panicked; worker continues");
        }
    }
    debug!(worker = index, "worker exiting");
}
