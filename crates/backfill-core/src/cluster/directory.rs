//! Cluster backend that keeps everything under one local directory.
//!
//! Layout:
//!
//! ```text
//! <root>/<pool>/pool.json                       {"id": 3}
//! <root>/<pool>/<ns>/directory/<image name>     image id
//! <root>/<pool>/<ns>/headers/<image id>.json    ImageInfo
//! <root>/<pool>/<ns>/metadata/<image id>.json   {"key": "value", ...}
//! <root>/<pool>/<ns>/object_map/<image id>      one byte per object
//! <root>/<pool>/<ns>/objects/<oid>
//! <root>/<pool>/<ns>/snaps/<snap id>/<oid>
//! <root>/<pool>/<ns>/locks/<oid>.json
//! <root>/auth/<client name>.key                 optional expected key
//! ```
//!
//! The default namespace is stored as `_default`. Watches are process-local.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use backfill_types::error::{BackfillError, Result};
use backfill_types::object::data_object_prefix;

use super::{
    Cluster, ClusterConnector, ImageEntry, ImageInfo, IoCtx, LockLease, ObjectState,
    PendingCluster, PoolInfo, PoolRef, WatchCallback,
};

const DEFAULT_NAMESPACE_DIR: &str = "_default";

#[derive(Debug, Serialize, Deserialize)]
struct PoolFile {
    id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    lock_name: String,
    cookie: String,
    tag: String,
    expires_ms: i64,
}

struct Watcher {
    dir: PathBuf,
    oid: String,
    callback: WatchCallback,
}

struct Inner {
    name: String,
    root: PathBuf,
    config: HashMap<String, String>,
    /// Serializes read-modify-write sequences within this process.
    io_lock: Mutex<()>,
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_watch_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Directory-backed cluster.
#[derive(Clone)]
pub struct DirCluster {
    inner: Arc<Inner>,
}

/// Reject names that could escape their directory.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackfillError::InvalidArgument(format!("empty {kind} name")));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(BackfillError::InvalidArgument(format!(
            "{kind} name '{name}' contains a path separator"
        )));
    }
    if Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(BackfillError::InvalidArgument(format!(
            "unsafe {kind} name '{name}'"
        )));
    }
    Ok(())
}

/// Write to a temp file in the target directory and rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BackfillError::InvalidArgument(format!("no parent for '{}'", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DirCluster {
    /// Open (or create) a cluster rooted at `root`.
    pub fn open(name: &str, root: &Path, config: HashMap<String, String>) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                root,
                config,
                io_lock: Mutex::new(()),
                watchers: Mutex::new(HashMap::new()),
                next_watch_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Create a pool directory, returning the existing id if it is already there.
    pub fn create_pool(&self, name: &str) -> Result<i64> {
        validate_name("pool", name)?;
        let _guard = self.inner.io_lock.lock().unwrap();
        let path = self.inner.root.join(name).join("pool.json");
        if let Some(existing) = read_json::<PoolFile>(&path)? {
            return Ok(existing.id);
        }
        let next = self
            .scan_pools()?
            .iter()
            .map(|p| p.id)
            .max()
            .unwrap_or(0)
            + 1;
        write_json(&path, &PoolFile { id: next })?;
        Ok(next)
    }

    /// Create an image header with a random id.
    pub fn create_image(
        &self,
        pool: &str,
        namespace: &str,
        name: &str,
        size: u64,
        object_size: u64,
    ) -> Result<ImageInfo> {
        validate_name("image", name)?;
        if object_size == 0 {
            return Err(BackfillError::InvalidArgument("object size must be non-zero".into()));
        }
        self.create_pool(pool)?;
        let io = DirIoCtx::new(Arc::clone(&self.inner), &PoolRef::Name(pool.to_string()), namespace)?;
        let _guard = self.inner.io_lock.lock().unwrap();
        let dir_entry = io.dir.join("directory").join(name);
        if dir_entry.exists() {
            return Err(BackfillError::AlreadyExists(format!("image '{pool}/{name}'")));
        }
        let id = hex::encode(rand::random::<[u8; 6]>());
        let info = ImageInfo {
            name: name.to_string(),
            id: id.clone(),
            size,
            object_size,
            object_prefix: data_object_prefix(&id),
            parent: None,
        };
        write_json(&io.header_path(&id), &info)?;
        atomic_write(&dir_entry, id.as_bytes())?;
        Ok(info)
    }

    /// Overwrite an image header (e.g. to attach a parent link).
    pub fn update_header(&self, pool: &str, namespace: &str, info: &ImageInfo) -> Result<()> {
        let io = DirIoCtx::new(Arc::clone(&self.inner), &PoolRef::Name(pool.to_string()), namespace)?;
        let _guard = self.inner.io_lock.lock().unwrap();
        write_json(&io.header_path(&info.id), info)
    }

    fn scan_pools(&self) -> Result<Vec<PoolInfo>> {
        let mut pools = Vec::new();
        let entries = match fs::read_dir(&self.inner.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pools),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(pf) = read_json::<PoolFile>(&entry.path().join("pool.json"))? {
                pools.push(PoolInfo { id: pf.id, name });
            }
        }
        pools.sort_by_key(|p| p.id);
        Ok(pools)
    }
}

impl Cluster for DirCluster {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        if !self.inner.root.is_dir() {
            return Err(BackfillError::IoTransient(format!(
                "cluster root '{}' is not accessible",
                self.inner.root.display()
            )));
        }
        self.scan_pools()
    }

    fn pool_id(&self, name: &str) -> Result<i64> {
        validate_name("pool", name)?;
        read_json::<PoolFile>(&self.inner.root.join(name).join("pool.json"))?
            .map(|p| p.id)
            .ok_or_else(|| BackfillError::NotFound(format!("pool '{name}'")))
    }

    fn pool_name(&self, id: i64) -> Result<String> {
        self.scan_pools()?
            .into_iter()
            .find(|p| p.id == id)
            .map(|p| p.name)
            .ok_or_else(|| BackfillError::NotFound(format!("pool id {id}")))
    }

    fn io_ctx(&self, pool: &PoolRef, namespace: &str) -> Result<Arc<dyn IoCtx>> {
        Ok(Arc::new(DirIoCtx::new(Arc::clone(&self.inner), pool, namespace)?))
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.inner.config.get(key).cloned()
    }

    fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            self.inner.watchers.lock().unwrap().clear();
            debug!(cluster = %self.inner.name, "directory cluster shut down");
        }
    }
}

struct DirIoCtx {
    inner: Arc<Inner>,
    pool_id: i64,
    pool_name: String,
    namespace: String,
    dir: PathBuf,
}

impl DirIoCtx {
    fn new(inner: Arc<Inner>, pool: &PoolRef, namespace: &str) -> Result<Self> {
        let cluster = DirCluster {
            inner: Arc::clone(&inner),
        };
        let (pool_id, pool_name) = match pool {
            PoolRef::Name(n) => (cluster.pool_id(n)?, n.clone()),
            PoolRef::Id(id) => (*id, cluster.pool_name(*id)?),
        };
        let ns_dir = if namespace.is_empty() {
            DEFAULT_NAMESPACE_DIR.to_string()
        } else {
            validate_name("namespace", namespace)?;
            namespace.to_string()
        };
        let dir = inner.root.join(&pool_name).join(ns_dir);
        Ok(Self {
            inner,
            pool_id,
            pool_name,
            namespace: namespace.to_string(),
            dir,
        })
    }

    fn header_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("headers").join(format!("{image_id}.json"))
    }

    fn metadata_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("metadata").join(format!("{image_id}.json"))
    }

    fn object_map_path(&self, image_id: &str) -> PathBuf {
        self.dir.join("object_map").join(image_id)
    }

    fn object_path(&self, oid: &str) -> Result<PathBuf> {
        validate_name("object", oid)?;
        Ok(self.dir.join("objects").join(oid))
    }

    fn lock_path(&self, oid: &str) -> Result<PathBuf> {
        validate_name("object", oid)?;
        Ok(self.dir.join("locks").join(format!("{oid}.json")))
    }

    fn load_metadata(&self, image_id: &str) -> Result<BTreeMap<String, String>> {
        self.require_image(image_id)?;
        Ok(read_json(&self.metadata_path(image_id))?.unwrap_or_default())
    }

    fn require_image(&self, image_id: &str) -> Result<()> {
        validate_name("image id", image_id)?;
        if self.header_path(image_id).is_file() {
            Ok(())
        } else {
            Err(BackfillError::NotFound(format!("image id '{image_id}'")))
        }
    }

    fn live_lock(&self, oid: &str) -> Result<Option<LockFile>> {
        Ok(read_json::<LockFile>(&self.lock_path(oid)?)?.filter(|l| l.expires_ms > now_ms()))
    }
}

impl IoCtx for DirIoCtx {
    fn pool_id(&self) -> i64 {
        self.pool_id
    }

    fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn list_images(&self) -> Result<Vec<ImageEntry>> {
        let dir = self.dir.join("directory");
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(".tmp") {
                continue;
            }
            let id = fs::read_to_string(entry.path())?.trim().to_string();
            images.push(ImageEntry { name, id });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    fn image_id(&self, image_name: &str) -> Result<String> {
        validate_name("image", image_name)?;
        match fs::read_to_string(self.dir.join("directory").join(image_name)) {
            Ok(id) => Ok(id.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackfillError::NotFound(format!("image '{image_name}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn image_info(&self, image_id: &str) -> Result<ImageInfo> {
        validate_name("image id", image_id)?;
        read_json(&self.header_path(image_id))?
            .ok_or_else(|| BackfillError::NotFound(format!("image id '{image_id}'")))
    }

    fn metadata_get(&self, image_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self.load_metadata(image_id)?.remove(key))
    }

    fn metadata_list(&self, image_id: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut all = self.load_metadata(image_id)?;
        all.retain(|k, _| k.starts_with(prefix));
        Ok(all)
    }

    fn metadata_set(&self, image_id: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.inner.io_lock.lock().unwrap();
        let mut all = self.load_metadata(image_id)?;
        all.insert(key.to_string(), value.to_string());
        write_json(&self.metadata_path(image_id), &all)
    }

    fn metadata_remove(&self, image_id: &str, key: &str) -> Result<()> {
        let _guard = self.inner.io_lock.lock().unwrap();
        let mut all = self.load_metadata(image_id)?;
        if all.remove(key).is_none() {
            return Err(BackfillError::NotFound(format!("metadata key '{key}'")));
        }
        write_json(&self.metadata_path(image_id), &all)
    }

    fn read(&self, oid: &str, offset: u64, len: u64, snap_id: Option<u64>) -> Result<Vec<u8>> {
        let path = match snap_id {
            Some(snap) => {
                validate_name("object", oid)?;
                self.dir.join("snaps").join(snap.to_string()).join(oid)
            }
            None => self.object_path(oid)?,
        };
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackfillError::NotFound(format!("object '{oid}'")));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stat(&self, oid: &str) -> Result<Option<u64>> {
        match fs::metadata(self.object_path(oid)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_full_exclusive(&self, oid: &str, data: &[u8], lease: &LockLease) -> Result<()> {
        match self.live_lock(oid)? {
            Some(l) if l.cookie == lease.cookie => {}
            _ => {
                return Err(BackfillError::Busy(format!(
                    "object '{oid}' is not locked by cookie '{}'",
                    lease.cookie
                )));
            }
        }
        let path = self.object_path(oid)?;
        let dir = self.dir.join("objects");
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BackfillError::AlreadyExists(format!("object '{oid}'")))
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn lock_exclusive(&self, lease: &LockLease) -> Result<()> {
        let _guard = self.inner.io_lock.lock().unwrap();
        if let Some(held) = self.live_lock(&lease.object_name)? {
            return Err(BackfillError::Busy(format!(
                "object '{}' locked by '{}'",
                lease.object_name, held.cookie
            )));
        }
        let expires_ms = now_ms()
            + i64::try_from(lease.duration.as_millis()).unwrap_or(i64::MAX / 2);
        write_json(
            &self.lock_path(&lease.object_name)?,
            &LockFile {
                lock_name: lease.lock_name.clone(),
                cookie: lease.cookie.clone(),
                tag: lease.tag.clone(),
                expires_ms,
            },
        )
    }

    fn unlock(&self, lease: &LockLease) -> Result<()> {
        let _guard = self.inner.io_lock.lock().unwrap();
        let path = self.lock_path(&lease.object_name)?;
        match read_json::<LockFile>(&path)? {
            Some(held) if held.cookie == lease.cookie && held.lock_name == lease.lock_name => {
                fs::remove_file(&path)?;
                Ok(())
            }
            _ => Err(BackfillError::NotFound(format!(
                "lock on '{}' with cookie '{}'",
                lease.object_name, lease.cookie
            ))),
        }
    }

    fn watch(&self, oid: &str, callback: WatchCallback) -> Result<u64> {
        validate_name("object", oid)?;
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::SeqCst);
        self.inner.watchers.lock().unwrap().insert(
            id,
            Watcher {
                dir: self.dir.clone(),
                oid: oid.to_string(),
                callback,
            },
        );
        Ok(id)
    }

    fn unwatch(&self, watch_id: u64) -> Result<()> {
        self.inner
            .watchers
            .lock()
            .unwrap()
            .remove(&watch_id)
            .map(|_| ())
            .ok_or_else(|| BackfillError::NotFound(format!("watch {watch_id}")))
    }

    fn notify(&self, oid: &str) -> Result<usize> {
        let callbacks: Vec<WatchCallback> = self
            .inner
            .watchers
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.dir == self.dir && w.oid == oid)
            .map(|w| Arc::clone(&w.callback))
            .collect();
        for cb in &callbacks {
            cb();
        }
        Ok(callbacks.len())
    }

    fn object_map_get(&self, image_id: &str, object_no: u64) -> Result<ObjectState> {
        self.require_image(image_id)?;
        let map = match fs::read(self.object_map_path(image_id)) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ObjectState::Nonexistent),
            Err(e) => return Err(e.into()),
        };
        let idx = usize::try_from(object_no).unwrap_or(usize::MAX);
        Ok(map
            .get(idx)
            .copied()
            .map(ObjectState::from_byte)
            .unwrap_or(ObjectState::Nonexistent))
    }

    fn object_map_set(&self, image_id: &str, object_no: u64, state: ObjectState) -> Result<()> {
        let _guard = self.inner.io_lock.lock().unwrap();
        let info = self.image_info(image_id)?;
        let count = backfill_types::object::num_objects(info.size, info.object_size);
        if object_no >= count {
            return Err(BackfillError::InvalidArgument(format!(
                "object {object_no} out of range for image '{}' ({count} objects)",
                info.name
            )));
        }
        let path = self.object_map_path(image_id);
        let mut map = match fs::read(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let idx = usize::try_from(object_no)
            .map_err(|_| BackfillError::InvalidArgument(format!("object {object_no} too large")))?;
        if map.len() <= idx {
            map.resize(idx + 1, ObjectState::Nonexistent.to_byte());
        }
        map[idx] = state.to_byte();
        atomic_write(&path, &map)
    }
}

// --- Connector ---

/// Connects to directory clusters registered by name.
#[derive(Clone, Default)]
pub struct DirConnector {
    roots: HashMap<String, PathBuf>,
}

impl DirConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, name: &str, root: &Path) -> Self {
        self.roots.insert(name.to_string(), root.to_path_buf());
        self
    }
}

impl ClusterConnector for DirConnector {
    fn create(&self, cluster_name: &str, client_name: &str) -> Result<Box<dyn PendingCluster>> {
        let root = self.roots.get(cluster_name).cloned().ok_or_else(|| {
            BackfillError::NotFound(format!("no directory registered for cluster '{cluster_name}'"))
        })?;
        Ok(Box::new(PendingDirCluster {
            cluster_name: cluster_name.to_string(),
            client_name: client_name.to_string(),
            root,
            conf: HashMap::new(),
        }))
    }
}

struct PendingDirCluster {
    cluster_name: String,
    client_name: String,
    root: PathBuf,
    conf: HashMap<String, String>,
}

impl PendingCluster for PendingDirCluster {
    fn conf_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.conf.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn connect(&mut self) -> Result<Arc<dyn Cluster>> {
        if self.conf.get("mon_host").is_none_or(|v| v.is_empty()) {
            return Err(BackfillError::InvalidArgument("mon_host is not set".into()));
        }
        if !self.root.is_dir() {
            return Err(BackfillError::IoTransient(format!(
                "cluster '{}' unreachable at '{}'",
                self.cluster_name,
                self.root.display()
            )));
        }
        validate_name("client", &self.client_name)?;
        let key_path = self.root.join("auth").join(format!("{}.key", self.client_name));
        match fs::read_to_string(&key_path) {
            Ok(expected) => {
                if self.conf.get("key").map(|k| k.trim()) != Some(expected.trim()) {
                    return Err(BackfillError::Forbidden(format!(
                        "authentication to '{}' as '{}' failed",
                        self.cluster_name, self.client_name
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let cluster = DirCluster::open(&self.cluster_name, &self.root, self.conf.clone())?;
        Ok(Arc::new(cluster))
    }

    fn shutdown(self: Box<Self>) {
        debug!(cluster = %self.cluster_name, "discarding unconnected handle");
    }
}
