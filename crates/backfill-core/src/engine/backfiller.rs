//! Walks one image's objects and backfills each from the parent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;

use super::request::{BackfillOutcome, ObjectBackfillRequest, RequestSettings};
use super::throttler::{BackfillThrottler, OpKey};
use super::work_queue::WorkQueue;
use crate::cluster::ObjectState;
use crate::image::ImageHandle;
use crate::metadata::{self, BackfillStatus};
use crate::parent::ParentReader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillProgress {
    pub image: String,
    pub total: u64,
    /// Objects walked so far in the current pass.
    pub current: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: u64,
    pub status: Option<BackfillStatus>,
}

#[derive(Default)]
struct Counters {
    current: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

struct Job {
    stopping: bool,
    in_flight: u64,
    status: Option<BackfillStatus>,
}

struct Shared {
    image: Arc<ImageHandle>,
    parent: Option<Arc<dyn ParentReader>>,
    throttler: Arc<BackfillThrottler>,
    throttle_owner: u64,
    work_queue: Arc<WorkQueue>,
    settings: RequestSettings,
    counters: Counters,
    job: Mutex<Job>,
    cond: Condvar,
}

/// Backfills one image on its own thread. After the pass it idles, keeping
/// the parent open, until [`stop`](Self::stop).
pub struct ImageBackfiller {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ImageBackfiller {
    pub fn new(
        image: Arc<ImageHandle>,
        parent: Option<Arc<dyn ParentReader>>,
        throttler: Arc<BackfillThrottler>,
        work_queue: Arc<WorkQueue>,
        settings: RequestSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                image,
                parent,
                throttle_owner: throttler.register(),
                throttler,
                work_queue,
                settings,
                counters: Counters::default(),
                job: Mutex::new(Job {
                    stopping: false,
                    in_flight: 0,
                    status: None,
                }),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &ImageSpec {
        self.shared.image.spec()
    }

    /// Spawn the backfill thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let name = format!("backfill-{}", self.shared.image.spec().image_name);
        *thread = Some(std::thread::Builder::new().name(name).spawn(move || shared.run())?);
        Ok(())
    }

    /// Stop enqueuing objects without waiting. In-flight objects finish.
    pub fn request_stop(&self) {
        let mut job = self.shared.job.lock().unwrap();
        if !job.stopping {
            debug!(image = %self.spec(), "stop requested");
            job.stopping = true;
        }
        self.shared.cond.notify_all();
    }

    /// Stop and join the backfill thread.
    pub fn stop(&self) {
        self.request_stop();
        let thread = self.thread.lock().unwrap().take();
        if let Some(t) = thread {
            if t.join().is_err() {
                error!(image = %self.spec(), "backfill thread panicked");
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.job.lock().unwrap().stopping
    }

    /// Status recorded at the end of the last pass.
    pub fn pass_status(&self) -> Option<BackfillStatus> {
        self.shared.job.lock().unwrap().status
    }

    /// Block until the pass has ended (or the backfiller is stopping).
    pub fn wait_for_pass(&self) -> Option<BackfillStatus> {
        let mut job = self.shared.job.lock().unwrap();
        while job.status.is_none() && !job.stopping {
            job = self.shared.cond.wait(job).unwrap();
        }
        job.status
    }

    pub fn progress(&self) -> BackfillProgress {
        let c = &self.shared.counters;
        let job = self.shared.job.lock().unwrap();
        BackfillProgress {
            image: self.spec().to_string(),
            total: self.shared.image.num_objects(),
            current: c.current.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            in_flight: job.in_flight,
            status: job.status,
        }
    }
}

impl Drop for ImageBackfiller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(self: Arc<Self>) {
        let spec = self.image.spec().clone();
        let total = self.image.num_objects();
        info!(image = %spec, objects = total, "backfill pass starting");
        self.record_status(BackfillStatus::Running);

        let mut interrupted = false;
        if total > 0 && self.parent.is_none() {
            error!(image = %spec, "image has no usable parent, nothing to backfill from");
            self.counters.failed.store(total, Ordering::SeqCst);
        } else {
            for object_no in 0..total {
                if self.is_stopping() {
                    debug!(image = %spec, object_no, "stopping before object");
                    interrupted = true;
                    break;
                }
                self.counters.current.store(object_no, Ordering::SeqCst);
                self.backfill_object(object_no);
            }
            if !interrupted {
                self.counters.current.store(total, Ordering::SeqCst);
            }
        }

        self.drain();
        // A stop that landed while the last objects were in flight still
        // leaves the walk complete.
        let status = if interrupted {
            BackfillStatus::Scheduled
        } else if self.counters.failed.load(Ordering::SeqCst) > 0 {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Complete
        };
        info!(
            image = %spec,
            status = %status,
            completed = self.counters.completed.load(Ordering::SeqCst),
            failed = self.counters.failed.load(Ordering::SeqCst),
            skipped = self.counters.skipped.load(Ordering::SeqCst),
            total,
            "backfill pass finished"
        );
        self.record_status(status);
        {
            let mut job = self.job.lock().unwrap();
            job.status = Some(status);
            self.cond.notify_all();
        }

        let mut job = self.job.lock().unwrap();
        while !job.stopping {
            job = self.cond.wait(job).unwrap();
        }
        debug!(image = %spec, "backfill thread exiting");
    }

    fn is_stopping(&self) -> bool {
        self.job.lock().unwrap().stopping
    }

    fn record_status(&self, status: BackfillStatus) {
        if let Err(e) = metadata::set_status(&self.image, status) {
            warn!(image = %self.image.spec(), status = %status, error = %e, "failed to record backfill status");
        }
    }

    fn drain(&self) {
        let mut job = self.job.lock().unwrap();
        while job.in_flight > 0 {
            job = self.cond.wait(job).unwrap();
        }
    }

    fn fail(&self, object_no: u64, err: &BackfillError) {
        warn!(image = %self.image.spec(), object_no, error = %err, "object backfill failed");
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn end_object(&self) {
        let mut job = self.job.lock().unwrap();
        job.in_flight -= 1;
        if job.in_flight == 0 {
            self.cond.notify_all();
        }
    }

    fn backfill_object(self: &Arc<Self>, object_no: u64) {
        match self.image.object_state(object_no) {
            Ok(ObjectState::Exists) => {
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Ok(ObjectState::Nonexistent) => {}
            Err(e) => {
                self.fail(object_no, &e);
                return;
            }
        }
        let Some(parent) = self.parent.as_ref() else {
            return;
        };
        let Some(expected) = self.image.object_len(object_no) else {
            return;
        };
        let start = object_no.saturating_mul(self.image.object_size());
        let readable = expected.min(parent.overlap().saturating_sub(start));
        if readable == 0 {
            // Entirely past the parent overlap.
            self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let key = OpKey::new(self.throttle_owner, object_no);
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        if let Err(e) = self.throttler.start(
            key,
            Box::new(move || {
                let _ = tx.send(());
            }),
        ) {
            self.fail(object_no, &e);
            return;
        }
        if rx.recv().is_err() {
            self.fail(object_no, &BackfillError::Cancelled);
            return;
        }
        self.job.lock().unwrap().in_flight += 1;

        let abort = |this: &Self| {
            this.throttler.finish(key);
            this.end_object();
        };
        if self.is_stopping() {
            abort(self);
            return;
        }

        let mut data = match parent.read(object_no, 0, readable) {
            Ok(d) => d,
            Err(e) => {
                self.fail(object_no, &e);
                abort(self);
                return;
            }
        };
        if data.len() as u64 != readable {
            let e = BackfillError::IoFatal(format!(
                "parent returned {} bytes for object {object_no}, expected {readable}",
                data.len()
            ));
            self.fail(object_no, &e);
            abort(self);
            return;
        }
        // Past the overlap the child reads as zeros.
        data.resize(expected as usize, 0);

        if self.is_stopping() {
            abort(self);
            return;
        }

        let this = Arc::clone(self);
        let request = ObjectBackfillRequest::new(
            Arc::clone(&self.image),
            object_no,
            data,
            self.settings,
            Arc::clone(&self.work_queue),
            Box::new(move |outcome| {
                match outcome {
                    BackfillOutcome::Written | BackfillOutcome::AlreadyPresent => {
                        this.counters.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    BackfillOutcome::Busy => {
                        info!(image = %this.image.spec(), object_no, "object busy, will retry next pass");
                        this.counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    BackfillOutcome::Cancelled => {
                        info!(image = %this.image.spec(), object_no, "object preempted by client");
                        this.counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    BackfillOutcome::Failed(e) => this.fail(object_no, &e),
                }
                this.throttler.finish(key);
                this.end_object();
            }),
        );
        request.send();
    }
}
