//! The backfill engine: worker pool, throttler, per-object requests, image
//! backfillers and the daemon that ties them together.

pub mod backfiller;
pub mod daemon;
pub mod request;
pub mod throttler;
pub mod work_queue;

pub use self::backfiller::{BackfillProgress, ImageBackfiller};
pub use self::daemon::{BackfillDaemon, DaemonStatus};
pub use self::request::{BackfillOutcome, ObjectBackfillRequest, RequestSettings};
pub use self::throttler::{BackfillThrottler, OpKey, ThrottlerStatus};
pub use self::work_queue::WorkQueue;
