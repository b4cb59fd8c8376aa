//! Per-image scheduling metadata.
//!
//! An operator marks an image for backfill by setting `backfill_scheduled`;
//! the engine only ever writes `backfill_status`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use backfill_types::error::{BackfillError, Result};

use crate::config::RemoteClusterConfig;
use crate::image::ImageHandle;
use crate::remote::{self, RemoteClusterRef, DEFAULT_CLIENT_NAME};
use crate::s3::config::KEY_PREFIX as S3_KEY_PREFIX;
use crate::s3::S3Config;

pub const KEY_SCHEDULED: &str = "backfill_scheduled";
pub const KEY_STATUS: &str = "backfill_status";

pub const KEY_REMOTE_PREFIX: &str = "remote.";
pub const KEY_REMOTE_CLUSTER_NAME: &str = "remote.cluster_name";
pub const KEY_REMOTE_MON_HOSTS: &str = "remote.mon_hosts";
pub const KEY_REMOTE_KEYRING: &str = "remote.keyring";
pub const KEY_REMOTE_CLIENT_NAME: &str = "remote.client_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Scheduled,
    Running,
    Complete,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackfillStatus::Scheduled => "scheduled",
            BackfillStatus::Running => "running",
            BackfillStatus::Complete => "complete",
            BackfillStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStatus {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(BackfillStatus::Scheduled),
            "running" => Ok(BackfillStatus::Running),
            "complete" => Ok(BackfillStatus::Complete),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(BackfillError::InvalidArgument(format!(
                "unknown backfill status '{other}'"
            ))),
        }
    }
}

/// `backfill_scheduled == "true"`.
pub fn is_scheduled(image: &ImageHandle) -> Result<bool> {
    Ok(image.metadata_get(KEY_SCHEDULED)?.as_deref() == Some("true"))
}

/// Current status; an unrecognised value reads as absent.
pub fn status(image: &ImageHandle) -> Result<Option<BackfillStatus>> {
    let Some(raw) = image.metadata_get(KEY_STATUS)? else {
        return Ok(None);
    };
    match raw.parse() {
        Ok(s) => Ok(Some(s)),
        Err(_) => {
            warn!(image = %image.spec(), value = %raw, "ignoring unknown backfill status");
            Ok(None)
        }
    }
}

pub fn set_status(image: &ImageHandle, status: BackfillStatus) -> Result<()> {
    debug!(image = %image.spec(), status = %status, "setting backfill status");
    image.metadata_set(KEY_STATUS, status.as_str())
}

/// S3 parent settings from `s3.*`, with the image's object size filled in.
/// `None` when the image has no `s3.enabled` key.
pub fn load_s3_config(image: &ImageHandle) -> Result<Option<S3Config>> {
    let meta = image.metadata_list(S3_KEY_PREFIX)?;
    Ok(S3Config::from_metadata(&meta).map(|mut c| {
        c.object_size = image.object_size();
        c
    }))
}

/// Remote cluster for a standalone parent, from `remote.*`.
///
/// Monitors and key missing from the metadata are taken from the
/// `remote_clusters` entry of the same name (its `conf` and `keyring`
/// files). `None` when the image has no `remote.*` keys.
pub fn load_remote_ref(
    image: &ImageHandle,
    remotes: &[RemoteClusterConfig],
) -> Result<Option<RemoteClusterRef>> {
    let meta = image.metadata_list(KEY_REMOTE_PREFIX)?;
    if meta.is_empty() {
        return Ok(None);
    }
    let get = |key: &str| meta.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let cluster_name = get(KEY_REMOTE_CLUSTER_NAME).ok_or_else(|| {
        BackfillError::InvalidArgument(format!(
            "image {} has remote metadata but no {KEY_REMOTE_CLUSTER_NAME}",
            image.spec()
        ))
    })?;
    let configured = remotes.iter().find(|r| r.name == cluster_name);

    let client_name = get(KEY_REMOTE_CLIENT_NAME)
        .map(str::to_string)
        .or_else(|| configured.map(|r| r.client_name.clone()))
        .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string());

    let mon_hosts = match get(KEY_REMOTE_MON_HOSTS) {
        Some(v) => remote::split_mon_hosts(v),
        None => match configured.and_then(|r| r.conf.as_deref()) {
            Some(conf) => remote::parse_mon_hosts(Path::new(conf))?.0,
            None => Vec::new(),
        },
    };
    if mon_hosts.is_empty() {
        return Err(BackfillError::InvalidArgument(format!(
            "no monitors known for remote cluster '{cluster_name}'"
        )));
    }

    let key = match get(KEY_REMOTE_KEYRING) {
        Some(v) => Zeroizing::new(v.to_string()),
        None => match configured.and_then(|r| r.keyring.as_deref()) {
            Some(keyring) => remote::read_keyring(Path::new(keyring), &client_name)?,
            None => {
                return Err(BackfillError::InvalidArgument(format!(
                    "no key known for remote cluster '{cluster_name}'"
                )));
            }
        },
    };

    Ok(Some(RemoteClusterRef {
        cluster_name: cluster_name.to_string(),
        mon_hosts,
        key,
        client_name,
    }))
}

/// Snapshot of an image's scheduling keys, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulingRecord {
    pub image: String,
    pub scheduled: bool,
    pub status: Option<BackfillStatus>,
    /// `s3.*` present and valid.
    pub s3_parent: bool,
    pub remote_cluster: Option<String>,
}

pub fn scheduling_record(image: &ImageHandle) -> Result<SchedulingRecord> {
    let s3_parent = load_s3_config(image)?.is_some_and(|c| c.is_valid());
    Ok(SchedulingRecord {
        image: image.spec().to_string(),
        scheduled: is_scheduled(image)?,
        status: status(image)?,
        s3_parent,
        remote_cluster: image.metadata_get(KEY_REMOTE_CLUSTER_NAME)?,
    })
}
