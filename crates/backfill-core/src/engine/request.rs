//! Per-object backfill: lock, write, mark in the object map, unlock.
//!
//! Each step runs as its own job on the work queue. The request is kept
//! alive only by the `Arc` captured in the next queued step, so it is freed
//! as soon as it completes.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use backfill_types::error::BackfillError;

use super::work_queue::WorkQueue;
use crate::cluster::{LockLease, ObjectState, DEFAULT_LOCK_DURATION};
use crate::image::ImageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Init,
    AcquireLock,
    WriteObject,
    UpdateObjectMap,
    ReleaseLock,
    Complete,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Init => "init",
            RequestState::AcquireLock => "acquire_lock",
            RequestState::WriteObject => "write_object",
            RequestState::UpdateObjectMap => "update_object_map",
            RequestState::ReleaseLock => "release_lock",
            RequestState::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum BackfillOutcome {
    /// Parent data written and the object marked present.
    Written,
    /// A client had already written the object; only the map was updated.
    AlreadyPresent,
    /// Someone else held the object lock.
    Busy,
    Cancelled,
    Failed(BackfillError),
}

impl BackfillOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackfillOutcome::Written | BackfillOutcome::AlreadyPresent)
    }
}

pub type Completion = Box<dyn FnOnce(BackfillOutcome) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct RequestSettings {
    pub lock_duration: Duration,
    /// Watch the object while locked and cancel on a client notify.
    pub preempt_on_notify: bool,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            preempt_on_notify: true,
        }
    }
}

static COOKIE_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
static COOKIE_SEQ: AtomicU64 = AtomicU64::new(0);

/// `backfill-<thread>-<monotonic ns>-<seq>`, unique within the process.
pub fn lock_cookie() -> String {
    let mut h = DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    let ns = COOKIE_EPOCH.elapsed().as_nanos();
    let seq = COOKIE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("backfill-{:x}-{ns}-{seq}", h.finish())
}

struct StepState {
    state: RequestState,
    lock_acquired: bool,
    /// A cancel arrived before the lock was released.
    cancelled_under_lock: bool,
    finished: bool,
    watch_id: Option<u64>,
    /// Set by the write step, confirmed once the object map is updated.
    written: Option<BackfillOutcome>,
    outcome: Option<BackfillOutcome>,
}

struct Request {
    this: Weak<Request>,
    image: Arc<ImageHandle>,
    object_no: u64,
    oid: String,
    data: Vec<u8>,
    lease: LockLease,
    settings: RequestSettings,
    work_queue: Arc<WorkQueue>,
    cancelled: AtomicBool,
    step: Mutex<StepState>,
    on_finish: Mutex<Option<Completion>>,
}

/// Cancels a running request. Does not keep it alive.
#[derive(Clone)]
pub struct RequestHandle {
    request: Weak<Request>,
}

impl RequestHandle {
    /// Ask the request to stop after its current step. No-op once complete.
    pub fn cancel(&self) {
        if let Some(req) = self.request.upgrade() {
            req.cancel();
        }
    }
}

/// Builder for one object's request.
pub struct ObjectBackfillRequest {
    request: Arc<Request>,
}

impl ObjectBackfillRequest {
    pub fn new(
        image: Arc<ImageHandle>,
        object_no: u64,
        data: Vec<u8>,
        settings: RequestSettings,
        work_queue: Arc<WorkQueue>,
        on_finish: Completion,
    ) -> Self {
        let oid = image.object_name(object_no);
        let lease = LockLease::backfill(&oid, lock_cookie(), settings.lock_duration);
        Self {
            request: Arc::new_cyclic(|this| Request {
                this: this.clone(),
                image,
                object_no,
                oid,
                data,
                lease,
                settings,
                work_queue,
                cancelled: AtomicBool::new(false),
                step: Mutex::new(StepState {
                    state: RequestState::Init,
                    lock_acquired: false,
                    cancelled_under_lock: false,
                    finished: false,
                    watch_id: None,
                    written: None,
                    outcome: None,
                }),
                on_finish: Mutex::new(Some(on_finish)),
            }),
        }
    }

    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            request: Arc::downgrade(&self.request),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.request.lease.cookie
    }

    /// Start the state machine. The completion runs on the work queue, or
    /// inline if the queue has been stopped.
    pub fn send(self) {
        debug!(object_no = self.request.object_no, oid = %self.request.oid, "backfill request start");
        self.request.advance(RequestState::AcquireLock);
    }
}

impl Request {
    fn cancel(&self) {
        if self.step.lock().unwrap().finished {
            return;
        }
        info!(object_no = self.object_no, "cancelling object backfill");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Move to `next` and queue it.
    fn advance(self: Arc<Self>, next: RequestState) {
        self.step.lock().unwrap().state = next;
        if next == RequestState::Complete {
            self.complete();
            return;
        }
        let req = Arc::clone(&self);
        if let Err(e) = self.work_queue.queue(Box::new(move || req.run_step())) {
            warn!(object_no = self.object_no, state = %next, error = %e, "running step inline");
            self.run_step();
        }
    }

    fn run_step(self: Arc<Self>) {
        let state = self.step.lock().unwrap().state;
        debug!(object_no = self.object_no, state = %state, "backfill step");
        let next = match state {
            RequestState::AcquireLock => self.acquire_lock(),
            RequestState::WriteObject => self.write_object(),
            RequestState::UpdateObjectMap => self.update_object_map(),
            RequestState::ReleaseLock => self.release_lock(),
            RequestState::Init | RequestState::Complete => RequestState::Complete,
        };
        self.advance(next);
    }

    fn set_outcome(&self, outcome: BackfillOutcome) {
        self.step.lock().unwrap().outcome = Some(outcome);
    }

    fn acquire_lock(&self) -> RequestState {
        if self.is_cancelled() {
            return RequestState::Complete;
        }
        let io = self.image.io();
        match io.lock_exclusive(&self.lease) {
            Ok(()) => {}
            Err(e) if e.is_busy() => {
                info!(object_no = self.object_no, "object locked by a client, skipping");
                self.set_outcome(BackfillOutcome::Busy);
                return RequestState::Complete;
            }
            Err(e) => {
                warn!(object_no = self.object_no, error = %e, "failed to lock object");
                self.set_outcome(BackfillOutcome::Failed(e));
                return RequestState::Complete;
            }
        }
        self.step.lock().unwrap().lock_acquired = true;

        if self.settings.preempt_on_notify {
            let weak = self.this.clone();
            let callback = Arc::new(move || {
                if let Some(req) = weak.upgrade() {
                    req.cancel();
                }
            });
            match io.watch(&self.oid, callback) {
                Ok(id) => self.step.lock().unwrap().watch_id = Some(id),
                Err(e) => {
                    warn!(object_no = self.object_no, error = %e, "failed to watch object, continuing without preemption");
                }
            }
        }

        if self.is_cancelled() {
            RequestState::ReleaseLock
        } else {
            RequestState::WriteObject
        }
    }

    fn write_object(&self) -> RequestState {
        if self.is_cancelled() {
            return RequestState::ReleaseLock;
        }
        match self
            .image
            .io()
            .write_full_exclusive(&self.oid, &self.data, &self.lease)
        {
            Ok(()) => {
                self.step.lock().unwrap().written = Some(BackfillOutcome::Written);
                RequestState::UpdateObjectMap
            }
            Err(BackfillError::AlreadyExists(_)) => {
                debug!(object_no = self.object_no, "object already written by a client");
                self.step.lock().unwrap().written = Some(BackfillOutcome::AlreadyPresent);
                RequestState::UpdateObjectMap
            }
            Err(e) => {
                warn!(object_no = self.object_no, error = %e, "object write failed");
                self.set_outcome(BackfillOutcome::Failed(e));
                RequestState::ReleaseLock
            }
        }
    }

    fn update_object_map(&self) -> RequestState {
        if self.is_cancelled() {
            return RequestState::ReleaseLock;
        }
        match self
            .image
            .io()
            .object_map_set(self.image.id(), self.object_no, ObjectState::Exists)
        {
            Ok(()) => {
                let mut st = self.step.lock().unwrap();
                st.outcome = st.written.take();
            }
            Err(e) => {
                warn!(object_no = self.object_no, error = %e, "object map update failed");
                self.set_outcome(BackfillOutcome::Failed(e));
            }
        }
        RequestState::ReleaseLock
    }

    fn release_lock(&self) -> RequestState {
        let watch_id = {
            let mut st = self.step.lock().unwrap();
            st.cancelled_under_lock = self.is_cancelled();
            st.watch_id.take()
        };
        let io = self.image.io();
        if let Some(id) = watch_id {
            if let Err(e) = io.unwatch(id) {
                warn!(object_no = self.object_no, error = %e, "failed to remove watch");
            }
        }
        if let Err(e) = io.unlock(&self.lease) {
            warn!(object_no = self.object_no, error = %e, "failed to release object lock");
        }
        self.step.lock().unwrap().lock_acquired = false;
        RequestState::Complete
    }

    fn complete(&self) {
        let outcome = {
            let mut st = self.step.lock().unwrap();
            if st.finished {
                return;
            }
            st.finished = true;
            st.state = RequestState::Complete;
            debug_assert!(!st.lock_acquired, "completing with the object lock held");
            match st.outcome.take() {
                _ if st.cancelled_under_lock => BackfillOutcome::Cancelled,
                Some(o) => o,
                None if self.is_cancelled() => BackfillOutcome::Cancelled,
                None => BackfillOutcome::Failed(BackfillError::LogicError(
                    "request completed without an outcome".into(),
                )),
            }
        };
        debug!(object_no = self.object_no, outcome = ?outcome, "backfill request complete");
        let on_finish = self.on_finish.lock().unwrap().take();
        if let Some(on_finish) = on_finish {
            on_finish(outcome);
        }
    }
}
