use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use super::defaults::*;
use super::deserialize::*;

/// Top-level daemon configuration, as read from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackfillConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub remote_clusters: Vec<RemoteClusterConfig>,
    /// Pools scanned during discovery. Empty means every pool.
    #[serde(default, deserialize_with = "deserialize_vec_strict_string")]
    pub pools: Vec<String>,
    /// Images that are always tracked, in `pool[/namespace]/image` form.
    #[serde(default, deserialize_with = "deserialize_vec_strict_string")]
    pub images: Vec<String>,
    #[serde(default)]
    pub backfill: EngineConfig,
    #[serde(default)]
    pub s3: S3ClientConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The local cluster the daemon backfills into.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name", deserialize_with = "deserialize_strict_string")]
    pub name: String,
    /// Root directory of the directory-backed cluster.
    #[serde(deserialize_with = "deserialize_strict_string")]
    pub path: String,
    #[serde(default = "default_client_name", deserialize_with = "deserialize_strict_string")]
    pub client_name: String,
    /// Client options; timeouts here are inherited by remote connections.
    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    pub options: BTreeMap<String, String>,
}

/// A remote cluster that standalone parents may live on.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteClusterConfig {
    #[serde(deserialize_with = "deserialize_strict_string")]
    pub name: String,
    /// Directory backend root for this cluster.
    #[serde(default, deserialize_with = "deserialize_optional_strict_string")]
    pub path: Option<String>,
    /// Cluster config file supplying `mon_host`.
    #[serde(default, deserialize_with = "deserialize_optional_strict_string")]
    pub conf: Option<String>,
    /// Keyring supplying the client key.
    #[serde(default, deserialize_with = "deserialize_optional_strict_string")]
    pub keyring: Option<String>,
    #[serde(default = "default_client_name", deserialize_with = "deserialize_strict_string")]
    pub client_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum objects backfilled at once across all images.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Size of the worker pool running request steps and completions.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(
        default = "default_discovery_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub discovery_interval: Duration,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    /// Cancel an in-flight object when a client notifies on it.
    #[serde(default = "default_true")]
    pub preempt_on_notify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            worker_threads: default_worker_threads(),
            discovery_interval: default_discovery_interval(),
            lock_duration_secs: default_lock_duration_secs(),
            preempt_on_notify: default_true(),
        }
    }
}

impl EngineConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }
}

/// HTTP client settings shared by every S3 parent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3ClientConfig {
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Abort a transfer slower than this many bytes per second...
    #[serde(default = "default_low_speed_limit")]
    pub low_speed_limit: u64,
    /// ...sustained for this many seconds.
    #[serde(default = "default_low_speed_time_secs")]
    pub low_speed_time_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

impl Default for S3ClientConfig {
    fn default() -> Self {
        Self {
            verify_tls: default_true(),
            retry_delay_ms: default_retry_delay_ms(),
            low_speed_limit: default_low_speed_limit(),
            low_speed_time_secs: default_low_speed_time_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Append log lines to this file instead of stderr.
    #[serde(default, deserialize_with = "deserialize_optional_strict_string")]
    pub file: Option<String>,
}
