use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size set of worker threads fed from one queue.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let cancelled = Arc::new(AtomicBool::new(false));
        let workers = (0..size.max(1))
            .filter_map(|i| {
                let rx = Arc::clone(&rx);
                let cancelled = Arc::clone(&cancelled);
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_loop(rx, cancelled))
                    .map_err(|e| error!("Could not spawn worker {}-{}: {}", name, i, e))
                    .ok()
            })
            .collect();
        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            cancelled,
        }
    }

    /// Queue `job`. After shutdown the job is handed back untouched.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let sender = match self.sender.lock() {
            Ok(sender) => sender,
            Err(_) => return Err(job),
        };
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Stop accepting jobs. With `wait`, queued jobs run and the workers are
    /// joined; without it, queued jobs are discarded and the workers are left
    /// to finish whatever they are running.
    pub fn shutdown(&self, wait: bool) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if !wait {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        if wait {
            for worker in workers {
                if worker.join().is_err() {
                    error!("A {} worker panicked", self.name);
                }
            }
        }
        debug!("Worker pool {} shut down", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, cancelled: Arc<AtomicBool>) {
    loop {
        let job = match rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) if cancelled.load(Ordering::SeqCst) => {
                drop(job);
                warn!("Discarding a queued job from a cancelled pool");
            }
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}
