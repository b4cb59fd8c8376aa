use std::io::ErrorKind;
use std::time::Duration;

use super::fetcher::FetchError;

/// Exponential backoff without jitter: `base * 2^n` before retry `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Body read failures that a fresh request may get past.
const TRANSIENT_IO: [ErrorKind; 6] = [
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionAborted,
    ErrorKind::BrokenPipe,
    ErrorKind::UnexpectedEof,
    ErrorKind::TimedOut,
    ErrorKind::Interrupted,
];

pub fn is_retryable_io(err: &std::io::Error) -> bool {
    TRANSIENT_IO.contains(&err.kind())
}

/// Run `f` until it succeeds, fails terminally, or the retry budget is spent.
///
/// `f` gets the 0-based attempt number. The last error is returned as is.
pub fn retry_fetch<T>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: impl FnMut(u32) -> std::result::Result<T, FetchError>,
) -> std::result::Result<T, FetchError> {
    let mut attempt = 0u32;
    loop {
        match f(attempt) {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient fetch error, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
