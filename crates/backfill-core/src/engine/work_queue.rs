//! Fixed pool of worker threads fed from one channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use backfill_types::error::{BackfillError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// Runs request steps and admission callbacks. Jobs are picked up in FIFO
/// order; with more than one worker they may finish out of order.
pub struct WorkQueue {
    tx: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
}

impl WorkQueue {
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Message>();
        let queued = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let queued = Arc::clone(&queued);
            let handle = std::thread::Builder::new()
                .name(format!("backfill-wq-{i}"))
                .spawn(move || worker_loop(rx, queued))?;
            workers.push(handle);
        }
        debug!(threads, "work queue started");
        Ok(Arc::new(Self {
            tx,
            workers: Mutex::new(workers),
            queued,
        }))
    }

    /// Queue `job`. Fails once the queue has been stopped.
    pub fn queue(&self, job: Job) -> Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Message::Run(job)).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            BackfillError::LogicError("work queue is stopped".into())
        })
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Let workers finish everything queued so far, then join them.
    pub fn stop(&self) {
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        if workers.is_empty() {
            return;
        }
        for _ in &workers {
            let _ = self.tx.send(Message::Stop);
        }
        let current = std::thread::current().id();
        for w in workers {
            if w.thread().id() == current {
                // Stopped from one of our own jobs; that worker exits on its own.
                continue;
            }
            if w.join().is_err() {
                error!("work queue thread panicked");
            }
        }
        debug!("work queue stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: Receiver<Message>, queued: Arc<AtomicUsize>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Run(job) => {
                job();
                queued.fetch_sub(1, Ordering::SeqCst);
            }
            Message::Stop => break,
        }
    }
}
