//! Small per-partition thread pool that runs stored-procedure bodies.
//!
//! Procedures block while their fragments execute, so they must not occupy the partition's loop
//! thread. Jobs queued after `cancel` are dropped unrun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::PartitionId;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of helper threads.
pub struct HelperPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    cancelled: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HelperPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperPool")
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl HelperPool {
    /// Starts `threads` helpers for `partition`. Zero is normalized to one.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when a thread cannot be spawned.
    pub fn start(partition: PartitionId, threads: usize) -> PtxResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = Arc::clone(&receiver);
            let cancelled = Arc::clone(&cancelled);
            let worker = thread::Builder::new()
                .name(format!("ptx-p{partition}-helper-{index}"))
                .spawn(move || helper_main(&receiver, &cancelled))
                .map_err(|_| PtxError::InvalidState("failed to spawn helper thread"))?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            cancelled,
            workers: Mutex::new(workers),
        })
    }

    /// Queues one job.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Shutdown` after `cancel`.
    pub fn submit(&self, job: Job) -> PtxResult<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(PtxError::Shutdown);
        }
        let sender = self
            .sender
            .lock()
            .map_err(|_| PtxError::InvalidState("helper pool mutex is poisoned"))?;
        let Some(sender) = sender.as_ref() else {
            return Err(PtxError::Shutdown);
        };
        sender.send(job).map_err(|_| PtxError::Shutdown)
    }

    /// Stops accepting jobs and drops every job not yet started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Waits for every helper thread to exit. Call after `cancel`.
    pub fn join(&self) {
        let workers = self
            .workers
            .lock()
            .map(|mut workers| std::mem::take(&mut *workers))
            .unwrap_or_default();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

fn helper_main(receiver: &Mutex<mpsc::Receiver<Job>>, cancelled: &AtomicBool) {
    loop {
        let job = {
            let Ok(receiver) = receiver.lock() else {
                error!("helper queue mutex is poisoned");
                return;
            };
            receiver.recv()
        };
        let Ok(job) = job else {
            return;
        };
        if cancelled.load(Ordering::Acquire) {
            debug!("dropping helper job after cancel");
            continue;
        }
        job();
    }
}
