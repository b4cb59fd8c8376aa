//! Connections to remote clusters that host standalone parents.

pub mod registry;

use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use backfill_types::error::{BackfillError, Result};

use crate::cluster::{Cluster, ClusterConnector, PendingCluster, INHERITED_TIMEOUT_KEYS};

pub use self::registry::{RemoteClusterRegistry, RemoteHandle};

pub const DEFAULT_CLIENT_NAME: &str = "client.admin";
pub const DEFAULT_CLUSTER_NAME: &str = "ceph";

/// Keyring lines longer than this are ignored.
pub const MAX_KEYRING_LINE: usize = 16 * 1024;

/// Everything needed to open a client handle to a remote cluster.
#[derive(Clone)]
pub struct RemoteClusterRef {
    pub cluster_name: String,
    pub mon_hosts: Vec<String>,
    /// Base64 secret, passed to the client verbatim.
    pub key: Zeroizing<String>,
    pub client_name: String,
}

impl fmt::Debug for RemoteClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClusterRef")
            .field("cluster_name", &self.cluster_name)
            .field("mon_hosts", &self.mon_hosts)
            .field("key", &"<redacted>")
            .field("client_name", &self.client_name)
            .finish()
    }
}

impl RemoteClusterRef {
    pub fn mon_host_value(&self) -> String {
        self.mon_hosts.join(",")
    }
}

/// Split a `mon_host` value into individual endpoints.
pub fn split_mon_hosts(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect::<String>()
        .to_ascii_lowercase()
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    v.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(v)
}

/// Cluster name implied by a config path: the basename up to `.conf`.
pub fn cluster_name_from_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.find(".conf").map(|end| n[..end].to_string()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string())
}

/// Read monitor endpoints from an INI cluster config.
///
/// `mon_host` is looked up in `[global]` first, then in any other section.
/// Returns the endpoints and the cluster name derived from the file name.
pub fn parse_mon_hosts(config_path: &Path) -> Result<(Vec<String>, String)> {
    let contents = std::fs::read_to_string(config_path)?;

    let mut section = String::new();
    let mut in_global: Option<String> = None;
    let mut elsewhere: Option<String> = None;
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                section = rest[..end].trim().to_string();
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if normalize_key(key) != "mon_host" {
            continue;
        }
        let value = value.split('#').next().unwrap_or_default();
        let value = unquote(value).to_string();
        if section == "global" {
            in_global.get_or_insert(value);
        } else {
            elsewhere.get_or_insert(value);
        }
    }

    let value = in_global.or(elsewhere).ok_or_else(|| {
        BackfillError::InvalidArgument(format!(
            "no mon_host in '{}'",
            config_path.display()
        ))
    })?;
    let hosts = split_mon_hosts(&value);
    if hosts.is_empty() {
        return Err(BackfillError::InvalidArgument(format!(
            "empty mon_host in '{}'",
            config_path.display()
        )));
    }
    Ok((hosts, cluster_name_from_path(config_path)))
}

/// Return the `key` of section `[client_name]` in an INI keyring, verbatim.
pub fn read_keyring(keyring_path: &Path, client_name: &str) -> Result<Zeroizing<String>> {
    let file = std::fs::File::open(keyring_path)?;
    let mut reader = BufReader::new(file);
    let mut line = Zeroizing::new(String::new());
    let mut in_client = false;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if line.len() > MAX_KEYRING_LINE {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('[') {
            in_client = match rest.find(']') {
                Some(end) if end > 0 => rest[..end].trim() == client_name,
                _ => false,
            };
            continue;
        }
        if !in_client {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            if key.trim() == "key" && !value.trim().is_empty() {
                return Ok(Zeroizing::new(value.trim().to_string()));
            }
        }
    }

    Err(BackfillError::NotFound(format!(
        "no key for '{client_name}' in '{}'",
        keyring_path.display()
    )))
}

/// Open a client handle to `remote`, inheriting timeouts from `local`.
///
/// The key is handed over in memory and on-disk keyring lookup is disabled.
/// A handle that fails to configure or connect is shut down before the
/// error is returned.
pub fn connect(
    connector: &dyn ClusterConnector,
    local: &dyn Cluster,
    remote: &RemoteClusterRef,
) -> Result<Arc<dyn Cluster>> {
    if remote.mon_hosts.is_empty() {
        return Err(BackfillError::InvalidArgument(format!(
            "no monitors for remote cluster '{}'",
            remote.cluster_name
        )));
    }
    let mut pending = connector.create(&remote.cluster_name, &remote.client_name)?;
    match configure_and_connect(pending.as_mut(), local, remote) {
        Ok(cluster) => {
            info!(
                cluster = %remote.cluster_name,
                client = %remote.client_name,
                mons = %remote.mon_host_value(),
                "connected to remote cluster"
            );
            Ok(cluster)
        }
        Err(e) => {
            debug!(cluster = %remote.cluster_name, error = %e, "remote connect failed");
            pending.shutdown();
            Err(e)
        }
    }
}

fn configure_and_connect(
    pending: &mut dyn PendingCluster,
    local: &dyn Cluster,
    remote: &RemoteClusterRef,
) -> Result<Arc<dyn Cluster>> {
    pending.conf_set("mon_host", &remote.mon_host_value())?;
    pending.conf_set("key", &remote.key)?;
    pending.conf_set("keyring", "")?;
    for key in INHERITED_TIMEOUT_KEYS {
        if let Some(value) = local.config_value(key) {
            pending.conf_set(key, &value)?;
        }
    }
    pending.connect()
}
