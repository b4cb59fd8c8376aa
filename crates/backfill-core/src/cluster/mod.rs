//! Interface to the block storage cluster.
//!
//! The engine never talks to a cluster client library directly; everything
//! goes through [`Cluster`] and [`IoCtx`]. The shipped backend is
//! [`directory::DirCluster`], which keeps pools, images and objects in a
//! local directory tree. Unit tests use an in-memory backend with fault
//! injection.

pub mod directory;
#[cfg(test)]
pub(crate) mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use backfill_types::error::Result;

/// Advisory lock class used for per-object backfill leases.
pub const BACKFILL_LOCK_NAME: &str = "rbd_lock";

/// Default lease duration for per-object locks.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Cluster-wide configuration keys a remote connection inherits from the
/// local cluster.
pub const INHERITED_TIMEOUT_KEYS: [&str; 3] = [
    "rados_osd_op_timeout",
    "rados_mon_op_timeout",
    "client_mount_timeout",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: i64,
    pub name: String,
}

/// How to address a pool when opening an I/O context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolRef {
    Name(String),
    Id(i64),
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRef::Name(n) => write!(f, "{n}"),
            PoolRef::Id(id) => write!(f, "#{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub name: String,
    pub id: String,
}

/// Parent link recorded in a child image's header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub pool_id: i64,
    /// Pool name as seen by the parent's cluster; required for remote parents
    /// because pool ids are cluster-local.
    #[serde(default)]
    pub pool_name: Option<String>,
    #[serde(default)]
    pub namespace: String,
    pub image_id: String,
    /// `None` for a standalone (live) parent.
    #[serde(default)]
    pub snap_id: Option<u64>,
    pub overlap: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub id: String,
    pub size: u64,
    pub object_size: u64,
    pub object_prefix: String,
    #[serde(default)]
    pub parent: Option<ParentLink>,
}

/// Per-object state in an image's object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    Nonexistent,
    Exists,
}

impl ObjectState {
    pub fn to_byte(self) -> u8 {
        match self {
            ObjectState::Nonexistent => 0,
            ObjectState::Exists => 1,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        if b == 0 {
            ObjectState::Nonexistent
        } else {
            ObjectState::Exists
        }
    }
}

/// A time-bounded exclusive advisory lock on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub object_name: String,
    pub lock_name: String,
    pub cookie: String,
    pub tag: String,
    pub duration: Duration,
}

impl LockLease {
    pub fn backfill(object_name: &str, cookie: String, duration: Duration) -> Self {
        Self {
            object_name: object_name.to_string(),
            lock_name: BACKFILL_LOCK_NAME.to_string(),
            cookie,
            tag: String::new(),
            duration,
        }
    }
}

/// Invoked on a notify for a watched object.
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// A connected cluster. Shared by `Arc` across the daemon, its backfillers
/// and per-object requests.
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    fn list_pools(&self) -> Result<Vec<PoolInfo>>;

    fn pool_id(&self, name: &str) -> Result<i64>;

    fn pool_name(&self, id: i64) -> Result<String>;

    fn io_ctx(&self, pool: &PoolRef, namespace: &str) -> Result<Arc<dyn IoCtx>>;

    /// Client configuration value, if set.
    fn config_value(&self, key: &str) -> Option<String>;

    /// Disconnect. May block on background work; idempotent.
    fn shutdown(&self);
}

/// Pool + namespace scoped access to images and objects.
pub trait IoCtx: Send + Sync {
    fn pool_id(&self) -> i64;

    fn pool_name(&self) -> &str;

    fn namespace(&self) -> &str;

    fn list_images(&self) -> Result<Vec<ImageEntry>>;

    fn image_id(&self, image_name: &str) -> Result<String>;

    fn image_info(&self, image_id: &str) -> Result<ImageInfo>;

    fn metadata_get(&self, image_id: &str, key: &str) -> Result<Option<String>>;

    fn metadata_list(&self, image_id: &str, prefix: &str) -> Result<BTreeMap<String, String>>;

    fn metadata_set(&self, image_id: &str, key: &str, value: &str) -> Result<()>;

    fn metadata_remove(&self, image_id: &str, key: &str) -> Result<()>;

    /// Read up to `len` bytes at `offset`. Returns fewer bytes at the end of
    /// the object and `NotFound` when the object does not exist. With
    /// `snap_id` the read is served from that snapshot.
    fn read(&self, oid: &str, offset: u64, len: u64, snap_id: Option<u64>) -> Result<Vec<u8>>;

    /// Object size, or `None` if absent.
    fn stat(&self, oid: &str) -> Result<Option<u64>>;

    /// Create `oid` with `data` as its full contents. Fails with `Busy` unless
    /// `lease` is currently held, and with `AlreadyExists` if the object is
    /// already present.
    fn write_full_exclusive(&self, oid: &str, data: &[u8], lease: &LockLease) -> Result<()>;

    /// Take `lease`. Fails with `Busy` while any other unexpired lease is held.
    fn lock_exclusive(&self, lease: &LockLease) -> Result<()>;

    /// Release `lease`. Fails with `NotFound` unless held under its cookie.
    fn unlock(&self, lease: &LockLease) -> Result<()>;

    fn watch(&self, oid: &str, callback: WatchCallback) -> Result<u64>;

    fn unwatch(&self, watch_id: u64) -> Result<()>;

    /// Deliver a notify to all watchers of `oid`; returns how many were hit.
    fn notify(&self, oid: &str) -> Result<usize>;

    fn object_map_get(&self, image_id: &str, object_no: u64) -> Result<ObjectState>;

    fn object_map_set(&self, image_id: &str, object_no: u64, state: ObjectState) -> Result<()>;
}

/// Factory for client handles to (possibly remote) clusters.
pub trait ClusterConnector: Send + Sync {
    fn create(&self, cluster_name: &str, client_name: &str) -> Result<Box<dyn PendingCluster>>;
}

/// A client handle that has been created but not yet connected.
pub trait PendingCluster: Send {
    fn conf_set(&mut self, key: &str, value: &str) -> Result<()>;

    fn connect(&mut self) -> Result<Arc<dyn Cluster>>;

    /// Tear down a handle that never finished connecting.
    fn shutdown(self: Box<Self>);
}
