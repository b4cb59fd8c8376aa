use std::time::Duration;

use backfill_types::error::{BackfillError, Result};

pub(super) fn default_cluster_name() -> String {
    "ceph".to_string()
}

pub(super) fn default_client_name() -> String {
    "client.admin".to_string()
}

pub(super) fn default_max_concurrent() -> usize {
    10
}

pub(super) fn default_worker_threads() -> usize {
    4
}

pub(super) fn default_discovery_interval() -> Duration {
    Duration::from_secs(60)
}

pub(super) fn default_lock_duration_secs() -> u64 {
    30
}

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_retry_delay_ms() -> u64 {
    1000
}

pub(super) fn default_low_speed_limit() -> u64 {
    1024
}

pub(super) fn default_low_speed_time_secs() -> u64 {
    30
}

pub(super) fn default_max_redirects() -> u32 {
    3
}

/// Parse a simple duration string like "45s", "30m", "4h" or "2d".
/// A bare number is taken as seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(BackfillError::Config("duration must not be empty".into()));
    }

    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        _ => (input, None),
    };

    let value: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| BackfillError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        None | Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(BackfillError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };

    if secs == 0 {
        return Err(BackfillError::Config(format!(
            "duration must be greater than zero: '{raw}'"
        )));
    }
    Ok(Duration::from_secs(secs))
}
