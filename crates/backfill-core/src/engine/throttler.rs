//! Global cap on objects in flight.
//!
//! Callers ask to [`start`](BackfillThrottler::start) an object with a resume
//! callback. The callback is queued on the work queue once a slot is free,
//! in the order requests arrived. [`finish`](BackfillThrottler::finish)
//! frees the slot and admits the next waiter.
//!
//! Several images share one throttler, so work is keyed by [`OpKey`]: the
//! owner id handed out by [`register`](BackfillThrottler::register) plus the
//! object number.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;
use tracing::{debug, error};

use backfill_types::error::{BackfillError, Result};

use super::work_queue::{Job, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpKey {
    pub owner: u64,
    pub object_no: u64,
}

impl OpKey {
    pub fn new(owner: u64, object_no: u64) -> Self {
        Self { owner, object_no }
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.object_no)
    }
}

struct PendingOp {
    key: OpKey,
    resume: Job,
}

struct State {
    in_flight: HashSet<OpKey>,
    pending: VecDeque<PendingOp>,
    max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottlerStatus {
    pub in_flight: usize,
    pub pending: usize,
    pub max_concurrent: usize,
}

pub struct BackfillThrottler {
    state: Mutex<State>,
    idle: Condvar,
    work_queue: Arc<WorkQueue>,
    next_owner: AtomicU64,
}

impl BackfillThrottler {
    pub fn new(max_concurrent: usize, work_queue: Arc<WorkQueue>) -> Self {
        Self {
            state: Mutex::new(State {
                in_flight: HashSet::new(),
                pending: VecDeque::new(),
                max_concurrent: max_concurrent.max(1),
            }),
            idle: Condvar::new(),
            work_queue,
            next_owner: AtomicU64::new(1),
        }
    }

    /// A fresh owner id for one image backfiller.
    pub fn register(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Admit `key` now if a slot is free, otherwise queue it. `resume` runs
    /// on the work queue once admitted.
    pub fn start(&self, key: OpKey, resume: Job) -> Result<()> {
        let admitted = {
            let mut st = self.state.lock().unwrap();
            if st.in_flight.contains(&key) || st.pending.iter().any(|p| p.key == key) {
                return Err(BackfillError::LogicError(format!(
                    "object {key} is already tracked by the throttler"
                )));
            }
            if st.in_flight.len() < st.max_concurrent && st.pending.is_empty() {
                st.in_flight.insert(key);
                Some(resume)
            } else {
                st.pending.push_back(PendingOp { key, resume });
                debug!(object = %key, pending = st.pending.len(), "object waiting for a slot");
                None
            }
        };
        if let Some(resume) = admitted {
            self.dispatch(key, resume);
        }
        Ok(())
    }

    /// Release the slot held by `key` and admit waiters.
    pub fn finish(&self, key: OpKey) {
        let ready = {
            let mut st = self.state.lock().unwrap();
            if !st.in_flight.remove(&key) {
                debug_assert!(false, "finish for object {key} that is not in flight");
                error!(object = %key, "finish for object that is not in flight");
                return;
            }
            let ready = admit(&mut st);
            if st.in_flight.is_empty() && st.pending.is_empty() {
                self.idle.notify_all();
            }
            ready
        };
        for op in ready {
            self.dispatch(op.key, op.resume);
        }
    }

    /// Change the cap; 0 is treated as 1. Raising it admits waiters.
    pub fn set_max_concurrent(&self, max: usize) {
        let ready = {
            let mut st = self.state.lock().unwrap();
            st.max_concurrent = max.max(1);
            admit(&mut st)
        };
        for op in ready {
            self.dispatch(op.key, op.resume);
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_concurrent
    }

    /// Block until nothing is in flight or waiting.
    pub fn wait_for_ops(&self) {
        let mut st = self.state.lock().unwrap();
        while !st.in_flight.is_empty() || !st.pending.is_empty() {
            st = self.idle.wait(st).unwrap();
        }
    }

    pub fn status(&self) -> ThrottlerStatus {
        let st = self.state.lock().unwrap();
        ThrottlerStatus {
            in_flight: st.in_flight.len(),
            pending: st.pending.len(),
            max_concurrent: st.max_concurrent,
        }
    }

    fn dispatch(&self, key: OpKey, resume: Job) {
        if let Err(e) = self.work_queue.queue(resume) {
            // Nothing will ever finish this object; give the slot back.
            error!(object = %key, error = %e, "failed to queue admitted object");
            self.finish(key);
        }
    }
}

/// Move waiters into free slots, FIFO.
fn admit(st: &mut State) -> Vec<PendingOp> {
    let mut ready = Vec::new();
    while st.in_flight.len() < st.max_concurrent {
        let Some(op) = st.pending.pop_front() else {
            break;
        };
        st.in_flight.insert(op.key);
        ready.push(op);
    }
    ready
}
