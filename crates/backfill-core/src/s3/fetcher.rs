//! HTTP range reads against S3-compatible endpoints.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use url::Url;

use backfill_types::error::BackfillError;

use super::config::S3Config;
use super::retry::{is_retryable_io, retry_fetch, RetryPolicy};
use super::signer::{amz_timestamp, SigV4Signer, UNSIGNED_PAYLOAD};
use super::tls::shared_agent;
use crate::config::S3ClientConfig;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("object not found")]
    NotFound,

    #[error("access denied")]
    Forbidden,

    #[error("requested range not satisfiable")]
    RangeUnsatisfiable,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("truncated response: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("malformed response body: {0}")]
    Corrupt(String),

    #[error("unexpected HTTP status {0}")]
    Http(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Timeouts, 5xx, connect failures and body-read resets.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_)
                | FetchError::Unreachable(_)
                | FetchError::Server(_)
                | FetchError::Transport(_)
        )
    }
}

impl From<FetchError> for BackfillError {
    fn from(e: FetchError) -> Self {
        let msg = e.to_string();
        match e {
            FetchError::NotFound => BackfillError::NotFound(format!("s3 object: {msg}")),
            FetchError::Forbidden => BackfillError::Forbidden(format!("s3 object: {msg}")),
            FetchError::RangeUnsatisfiable | FetchError::InvalidRequest(_) => {
                BackfillError::InvalidArgument(msg)
            }
            FetchError::Timeout(_)
            | FetchError::Unreachable(_)
            | FetchError::Server(_)
            | FetchError::Transport(_) => BackfillError::IoTransient(msg),
            FetchError::Truncated { .. } | FetchError::Corrupt(_) | FetchError::Http(_) => {
                BackfillError::IoFatal(msg)
            }
        }
    }
}

/// What a successful fetch put in the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReply {
    /// Exactly the requested range.
    Partial,
    /// The whole object; a ranged caller has to slice it.
    Whole,
}

/// Abort a transfer that moves fewer than `bytes_per_sec` on average over
/// `window`. A zero rate disables the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowSpeedLimit {
    pub bytes_per_sec: u64,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Total deadline for one attempt.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub low_speed: LowSpeedLimit,
    pub verify_tls: bool,
    pub max_redirects: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_client(&S3ClientConfig::default(), Duration::from_millis(30_000), 3)
    }
}

impl FetchOptions {
    pub fn from_client(client: &S3ClientConfig, timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(client.retry_delay_ms),
            },
            low_speed: LowSpeedLimit {
                bytes_per_sec: client.low_speed_limit,
                window: Duration::from_secs(client.low_speed_time_secs),
            },
            verify_tls: client.verify_tls,
            max_redirects: client.max_redirects,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub requests: u64,
    pub retries: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    bytes: AtomicU64,
}

/// Range GET client. Cloning shares the agent and the counters.
#[derive(Clone)]
pub struct HttpRangeFetcher {
    agent: ureq::Agent,
    signer: Option<SigV4Signer>,
    options: FetchOptions,
    counters: Arc<Counters>,
}

impl HttpRangeFetcher {
    pub fn new(signer: Option<SigV4Signer>, options: FetchOptions) -> Result<Self, FetchError> {
        let agent = shared_agent(options.verify_tls, options.max_redirects)?;
        Ok(Self {
            agent,
            signer,
            options,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Fetcher for an S3 parent: signs when the config carries credentials.
    pub fn for_config(config: &S3Config, client: &S3ClientConfig) -> Result<Self, FetchError> {
        let signer = match (&config.access_key, &config.secret_key) {
            (Some(ak), Some(sk)) => Some(SigV4Signer::new(ak, sk.clone(), &config.region)),
            _ => None,
        };
        let options = FetchOptions::from_client(client, config.timeout(), config.max_retries);
        Self::new(signer, options)
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
        }
    }

    /// GET `url`, ranged to `[byte_start, byte_start + byte_length)` when
    /// `byte_length > 0`, into `out`. `out` is cleared before every attempt.
    pub fn fetch(
        &self,
        url: &str,
        byte_start: u64,
        byte_length: u64,
        out: &mut Vec<u8>,
    ) -> Result<FetchReply, FetchError> {
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::InvalidRequest(format!("invalid URL '{url}': {e}")))?;
        let range = if byte_length > 0 {
            let end = byte_start.checked_add(byte_length - 1).ok_or_else(|| {
                FetchError::InvalidRequest(format!(
                    "range {byte_start}+{byte_length} overflows"
                ))
            })?;
            Some(format!("bytes={byte_start}-{end}"))
        } else {
            None
        };

        tracing::debug!(url = %parsed, range = range.as_deref().unwrap_or("-"), "s3 fetch");
        retry_fetch(&self.options.retry, "s3 get", |attempt| {
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
            }
            out.clear();
            self.fetch_once(&parsed, range.as_deref(), byte_length, out)
        })
    }

    /// Run [`fetch`](Self::fetch) on a detached thread and hand the result to
    /// `on_done` there.
    pub fn fetch_async<F>(&self, url: String, byte_start: u64, byte_length: u64, on_done: F)
    where
        F: FnOnce(Result<(Vec<u8>, FetchReply), FetchError>) + Send + 'static,
    {
        let fetcher = self.clone();
        crate::detach::detach(
            "s3-fetch",
            move || {
                let mut buf = Vec::new();
                fetcher
                    .fetch(&url, byte_start, byte_length, &mut buf)
                    .map(|reply| (buf, reply))
            },
            on_done,
            |e| Err(FetchError::Transport(format!("cannot spawn fetch thread: {e}"))),
        );
    }

    fn fetch_once(
        &self,
        url: &Url,
        range: Option<&str>,
        byte_length: u64,
        out: &mut Vec<u8>,
    ) -> Result<FetchReply, FetchError> {
        let mut req = self.agent.get(url.as_str()).timeout(self.options.timeout);
        if let Some(range) = range {
            req = req.set("Range", range);
        }
        if let Some(signer) = &self.signer {
            let timestamp = amz_timestamp(Utc::now());
            let extra: Vec<(&str, &str)> = range.map(|r| ("range", r)).into_iter().collect();
            let auth = signer.sign(
                "GET",
                &host_header(url),
                url.path(),
                url.query().unwrap_or(""),
                &extra,
                &timestamp,
            );
            req = req
                .set("x-amz-date", &timestamp)
                .set("x-amz-content-sha256", UNSIGNED_PAYLOAD)
                .set("Authorization", &auth);
        }

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let resp = match req.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => return Err(status_error(code)),
            Err(ureq::Error::Transport(t)) => return Err(transport_error(&t)),
        };

        let status = resp.status();
        let reply = match status {
            206 => FetchReply::Partial,
            200 => {
                if range.is_some() {
                    tracing::warn!(url = %url, "server ignored Range header, got whole object");
                }
                FetchReply::Whole
            }
            other => return Err(status_error(other)),
        };

        read_body(resp.into_reader(), out, self.options.low_speed)?;
        self.counters
            .bytes
            .fetch_add(out.len() as u64, Ordering::Relaxed);

        if reply == FetchReply::Partial && byte_length > 0 && out.len() as u64 != byte_length {
            return Err(FetchError::Truncated {
                expected: byte_length,
                got: out.len() as u64,
            });
        }
        Ok(reply)
    }
}

/// The `Host` value the agent will send: port only when not the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn status_error(code: u16) -> FetchError {
    match code {
        404 => FetchError::NotFound,
        403 => FetchError::Forbidden,
        416 => FetchError::RangeUnsatisfiable,
        500..=599 => FetchError::Server(code),
        other => FetchError::Http(other),
    }
}

fn transport_error(t: &ureq::Transport) -> FetchError {
    use std::error::Error as _;
    use ureq::ErrorKind;

    let msg = t.to_string();
    match t.kind() {
        ErrorKind::Dns | ErrorKind::ConnectionFailed => FetchError::Unreachable(msg),
        ErrorKind::InvalidUrl
        | ErrorKind::UnknownScheme
        | ErrorKind::InsecureRequestHttpsOnly
        | ErrorKind::TooManyRedirects
        | ErrorKind::InvalidProxyUrl => FetchError::InvalidRequest(msg),
        ErrorKind::Io => match t.source().and_then(|s| s.downcast_ref::<std::io::Error>()) {
            Some(io) if is_timeout(io) => FetchError::Timeout(msg),
            _ => FetchError::Transport(msg),
        },
        _ => FetchError::Transport(msg),
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

fn body_error(err: std::io::Error) -> FetchError {
    if is_timeout(&err) {
        FetchError::Timeout(format!("body read: {err}"))
    } else if is_retryable_io(&err) {
        FetchError::Transport(format!("body read: {err}"))
    } else {
        FetchError::Corrupt(err.to_string())
    }
}

fn read_body(
    mut reader: impl Read,
    out: &mut Vec<u8>,
    low_speed: LowSpeedLimit,
) -> Result<(), FetchError> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(body_error(e)),
        };
        out.extend_from_slice(&buf[..n]);
        window_bytes += n as u64;

        let elapsed = window_start.elapsed();
        if low_speed.bytes_per_sec > 0 && elapsed >= low_speed.window {
            let floor = low_speed
                .bytes_per_sec
                .saturating_mul(elapsed.as_secs().max(1));
            if window_bytes < floor {
                return Err(FetchError::Timeout(format!(
                    "transfer below {} B/s for {}s",
                    low_speed.bytes_per_sec,
                    elapsed.as_secs()
                )));
            }
            window_start = Instant::now();
            window_bytes = 0;
        }
    }
}
