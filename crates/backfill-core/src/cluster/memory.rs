//! In-process cluster for unit tests.
//!
//! Everything lives behind one mutex. Fault injection hooks let tests hold
//! foreign locks, fail writes and slow the write path down.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backfill_types::error::{BackfillError, Result};
use backfill_types::object::data_object_prefix;

use super::{
    Cluster, ClusterConnector, ImageEntry, ImageInfo, IoCtx, LockLease, ObjectState,
    ParentLink, PendingCluster, PoolInfo, PoolRef, WatchCallback,
};

/// Cluster-side operations recorded in order, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Lock { oid: String, cookie: String },
    Unlock { oid: String, cookie: String },
    Write { oid: String, len: usize },
    MapSet { image_id: String, object_no: u64 },
    Watch { oid: String },
    Unwatch { oid: String },
}

struct HeldLock {
    cookie: String,
    expires: Instant,
}

struct MemImage {
    info: ImageInfo,
    metadata: BTreeMap<String, String>,
    object_map: BTreeMap<u64, ObjectState>,
}

#[derive(Default)]
struct MemNamespace {
    images: BTreeMap<String, MemImage>,
    names: BTreeMap<String, String>,
    objects: HashMap<String, Vec<u8>>,
    snapshots: HashMap<(String, u64), Vec<u8>>,
    locks: HashMap<String, HeldLock>,
}

#[derive(Default)]
struct MemState {
    pools: BTreeMap<i64, String>,
    namespaces: HashMap<(i64, String), MemNamespace>,
    next_pool_id: i64,
    next_image_id: u64,
    events: Vec<ClusterEvent>,
}

#[derive(Default)]
struct Faults {
    fail_writes: HashSet<String>,
    fail_unlock: bool,
    fail_list_pools: bool,
    write_delay: Option<Duration>,
}

struct Watcher {
    pool_id: i64,
    namespace: String,
    oid: String,
    callback: WatchCallback,
}

struct Inner {
    name: String,
    state: Mutex<MemState>,
    watchers: Mutex<HashMap<u64, Watcher>>,
    next_watch_id: AtomicU64,
    config: Mutex<HashMap<String, String>>,
    faults: Mutex<Faults>,
    writes: AtomicUsize,
    active_writes: AtomicUsize,
    peak_writes: AtomicUsize,
    shutdowns: AtomicUsize,
    shut_down: AtomicBool,
}

/// Thread-safe in-memory cluster. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(MemState {
                    next_pool_id: 1,
                    next_image_id: 0x1000,
                    ..Default::default()
                }),
                watchers: Mutex::new(HashMap::new()),
                next_watch_id: AtomicU64::new(1),
                config: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                writes: AtomicUsize::new(0),
                active_writes: AtomicUsize::new(0),
                peak_writes: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn create_pool(&self, name: &str) -> i64 {
        let mut st = self.inner.state.lock().unwrap();
        if let Some((id, _)) = st.pools.iter().find(|(_, n)| n.as_str() == name) {
            return *id;
        }
        let id = st.next_pool_id;
        st.next_pool_id += 1;
        st.pools.insert(id, name.to_string());
        id
    }

    /// Create an image and return its header. The pool is created on demand.
    pub fn create_image(
        &self,
        pool: &str,
        namespace: &str,
        name: &str,
        size: u64,
        object_size: u64,
    ) -> ImageInfo {
        let pool_id = self.create_pool(pool);
        let mut st = self.inner.state.lock().unwrap();
        let id = format!("{:x}", st.next_image_id);
        st.next_image_id += 1;
        let info = ImageInfo {
            name: name.to_string(),
            id: id.clone(),
            size,
            object_size,
            object_prefix: data_object_prefix(&id),
            parent: None,
        };
        let ns = st
            .namespaces
            .entry((pool_id, namespace.to_string()))
            .or_default();
        ns.names.insert(name.to_string(), id.clone());
        ns.images.insert(
            id,
            MemImage {
                info: info.clone(),
                metadata: BTreeMap::new(),
                object_map: BTreeMap::new(),
            },
        );
        info
    }

    pub fn set_parent(&self, pool: &str, namespace: &str, image_id: &str, parent: ParentLink) {
        self.with_image(pool, namespace, image_id, |img| img.info.parent = Some(parent));
    }

    pub fn set_metadata(&self, pool: &str, namespace: &str, image_id: &str, key: &str, value: &str) {
        self.with_image(pool, namespace, image_id, |img| {
            img.metadata.insert(key.to_string(), value.to_string());
        });
    }

    pub fn metadata(&self, pool: &str, namespace: &str, image_id: &str, key: &str) -> Option<String> {
        let mut out = None;
        self.with_image(pool, namespace, image_id, |img| out = img.metadata.get(key).cloned());
        out
    }

    pub fn object_map_state(
        &self,
        pool: &str,
        namespace: &str,
        image_id: &str,
        object_no: u64,
    ) -> ObjectState {
        let mut out = ObjectState::Nonexistent;
        self.with_image(pool, namespace, image_id, |img| {
            out = img
                .object_map
                .get(&object_no)
                .copied()
                .unwrap_or(ObjectState::Nonexistent)
        });
        out
    }

    pub fn put_object(&self, pool: &str, namespace: &str, oid: &str, data: &[u8]) {
        let pool_id = self.create_pool(pool);
        let mut st = self.inner.state.lock().unwrap();
        st.namespaces
            .entry((pool_id, namespace.to_string()))
            .or_default()
            .objects
            .insert(oid.to_string(), data.to_vec());
    }

    pub fn object(&self, pool: &str, namespace: &str, oid: &str) -> Option<Vec<u8>> {
        let st = self.inner.state.lock().unwrap();
        let pool_id = pool_id_by_name(&st, pool)?;
        st.namespaces
            .get(&(pool_id, namespace.to_string()))
            .and_then(|ns| ns.objects.get(oid).cloned())
    }

    /// Freeze the current contents of every object of `image_id` under `snap_id`.
    pub fn create_snapshot(&self, pool: &str, namespace: &str, image_id: &str, snap_id: u64) {
        let mut st = self.inner.state.lock().unwrap();
        let Some(pool_id) = pool_id_by_name(&st, pool) else {
            return;
        };
        let Some(ns) = st.namespaces.get_mut(&(pool_id, namespace.to_string())) else {
            return;
        };
        let Some(prefix) = ns.images.get(image_id).map(|i| format!("{}.", i.info.object_prefix))
        else {
            return;
        };
        let frozen: Vec<(String, Vec<u8>)> = ns
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (oid, data) in frozen {
            ns.snapshots.insert((oid, snap_id), data);
        }
    }

    /// Take a lock on behalf of some other client (e.g. client I/O).
    pub fn hold_lock(&self, pool: &str, namespace: &str, oid: &str, cookie: &str, duration: Duration) {
        let pool_id = self.create_pool(pool);
        let mut st = self.inner.state.lock().unwrap();
        st.namespaces
            .entry((pool_id, namespace.to_string()))
            .or_default()
            .locks
            .insert(
                oid.to_string(),
                HeldLock {
                    cookie: cookie.to_string(),
                    expires: Instant::now() + duration,
                },
            );
    }

    pub fn lock_holder(&self, pool: &str, namespace: &str, oid: &str) -> Option<String> {
        let st = self.inner.state.lock().unwrap();
        let pool_id = pool_id_by_name(&st, pool)?;
        st.namespaces
            .get(&(pool_id, namespace.to_string()))
            .and_then(|ns| ns.locks.get(oid))
            .filter(|l| l.expires > Instant::now())
            .map(|l| l.cookie.clone())
    }

    /// Number of locks currently held anywhere in the cluster.
    pub fn held_lock_count(&self) -> usize {
        let st = self.inner.state.lock().unwrap();
        let now = Instant::now();
        st.namespaces
            .values()
            .map(|ns| ns.locks.values().filter(|l| l.expires > now).count())
            .sum()
    }

    pub fn fail_writes_to(&self, oid: &str) {
        self.inner.faults.lock().unwrap().fail_writes.insert(oid.to_string());
    }

    pub fn fail_unlock(&self, fail: bool) {
        self.inner.faults.lock().unwrap().fail_unlock = fail;
    }

    pub fn fail_list_pools(&self, fail: bool) {
        self.inner.faults.lock().unwrap().fail_list_pools = fail;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.inner.faults.lock().unwrap().write_delay = delay;
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.inner
            .config
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.inner.state.lock().unwrap().events.clone()
    }

    /// Successful object writes since creation.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed in flight at once.
    pub fn peak_concurrent_writes(&self) -> usize {
        self.inner.peak_writes.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn with_image(&self, pool: &str, namespace: &str, image_id: &str, f: impl FnOnce(&mut MemImage)) {
        let mut st = self.inner.state.lock().unwrap();
        let Some(pool_id) = pool_id_by_name(&st, pool) else {
            return;
        };
        if let Some(img) = st
            .namespaces
            .get_mut(&(pool_id, namespace.to_string()))
            .and_then(|ns| ns.images.get_mut(image_id))
        {
            f(img);
        }
    }
}

fn pool_id_by_name(st: &MemState, name: &str) -> Option<i64> {
    st.pools
        .iter()
        .find(|(_, n)| n.as_str() == name)
        .map(|(id, _)| *id)
}

impl Cluster for MemoryCluster {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        if self.inner.faults.lock().unwrap().fail_list_pools {
            return Err(BackfillError::IoTransient("cluster unreachable".into()));
        }
        let st = self.inner.state.lock().unwrap();
        Ok(st
            .pools
            .iter()
            .map(|(id, name)| PoolInfo {
                id: *id,
                name: name.clone(),
            })
            .collect())
    }

    fn pool_id(&self, name: &str) -> Result<i64> {
        let st = self.inner.state.lock().unwrap();
        pool_id_by_name(&st, name).ok_or_else(|| BackfillError::NotFound(format!("pool '{name}'")))
    }

    fn pool_name(&self, id: i64) -> Result<String> {
        let st = self.inner.state.lock().unwrap();
        st.pools
            .get(&id)
            .cloned()
            .ok_or_else(|| BackfillError::NotFound(format!("pool id {id}")))
    }

    fn io_ctx(&self, pool: &PoolRef, namespace: &str) -> Result<Arc<dyn IoCtx>> {
        let (pool_id, pool_name) = match pool {
            PoolRef::Name(name) => (self.pool_id(name)?, name.clone()),
            PoolRef::Id(id) => (*id, self.pool_name(*id)?),
        };
        Ok(Arc::new(MemoryIoCtx {
            inner: Arc::clone(&self.inner),
            pool_id,
            pool_name,
            namespace: namespace.to_string(),
        }))
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.inner.config.lock().unwrap().get(key).cloned()
    }

    fn shutdown(&self) {
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }
}

struct MemoryIoCtx {
    inner: Arc<Inner>,
    pool_id: i64,
    pool_name: String,
    namespace: String,
}

impl MemoryIoCtx {
    fn with_ns<T>(&self, f: impl FnOnce(&mut MemNamespace, &mut Vec<ClusterEvent>) -> Result<T>) -> Result<T> {
        let mut st = self.inner.state.lock().unwrap();
        let MemState {
            namespaces, events, ..
        } = &mut *st;
        let ns = namespaces
            .entry((self.pool_id, self.namespace.clone()))
            .or_default();
        f(ns, events)
    }

    fn with_image<T>(&self, image_id: &str, f: impl FnOnce(&mut MemImage, &mut Vec<ClusterEvent>) -> Result<T>) -> Result<T> {
        self.with_ns(|ns, events| {
            let img = ns
                .images
                .get_mut(image_id)
                .ok_or_else(|| BackfillError::NotFound(format!("image id '{image_id}'")))?;
            f(img, events)
        })
    }
}

fn lock_is_live(lock: &HeldLock) -> bool {
    lock.expires > Instant::now()
}

impl IoCtx for MemoryIoCtx {
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
        self.with_ns(|ns, _| {
            Ok(ns
                .names
                .iter()
                .map(|(name, id)| ImageEntry {
                    name: name.clone(),
                    id: id.clone(),
                })
                .collect())
        })
    }

    fn image_id(&self, image_name: &str) -> Result<String> {
        self.with_ns(|ns, _| {
            ns.names
                .get(image_name)
                .cloned()
                .ok_or_else(|| BackfillError::NotFound(format!("image '{image_name}'")))
        })
    }

    fn image_info(&self, image_id: &str) -> Result<ImageInfo> {
        self.with_image(image_id, |img, _| Ok(img.info.clone()))
    }

    fn metadata_get(&self, image_id: &str, key: &str) -> Result<Option<String>> {
        self.with_image(image_id, |img, _| Ok(img.metadata.get(key).cloned()))
    }

    fn metadata_list(&self, image_id: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.with_image(image_id, |img, _| {
            Ok(img
                .metadata
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }

    fn metadata_set(&self, image_id: &str, key: &str, value: &str) -> Result<()> {
        self.with_image(image_id, |img, _| {
            img.metadata.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn metadata_remove(&self, image_id: &str, key: &str) -> Result<()> {
        self.with_image(image_id, |img, _| {
            img.metadata
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| BackfillError::NotFound(format!("metadata key '{key}'")))
        })
    }

    fn read(&self, oid: &str, offset: u64, len: u64, snap_id: Option<u64>) -> Result<Vec<u8>> {
        self.with_ns(|ns, _| {
            let data = match snap_id {
                Some(snap) => ns.snapshots.get(&(oid.to_string(), snap)),
                None => ns.objects.get(oid),
            }
            .ok_or_else(|| BackfillError::NotFound(format!("object '{oid}'")))?;
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
            let end = usize::try_from(offset.saturating_add(len))
                .unwrap_or(usize::MAX)
                .min(data.len());
            Ok(data[start..end].to_vec())
        })
    }

    fn stat(&self, oid: &str) -> Result<Option<u64>> {
        self.with_ns(|ns, _| Ok(ns.objects.get(oid).map(|d| d.len() as u64)))
    }

    fn write_full_exclusive(&self, oid: &str, data: &[u8], lease: &LockLease) -> Result<()> {
        let (fail, delay) = {
            let faults = self.inner.faults.lock().unwrap();
            (faults.fail_writes.contains(oid), faults.write_delay)
        };

        self.with_ns(|ns, _| match ns.locks.get(oid) {
            Some(l) if lock_is_live(l) && l.cookie == lease.cookie => Ok(()),
            _ => Err(BackfillError::Busy(format!(
                "object '{oid}' is not locked by cookie '{}'",
                lease.cookie
            ))),
        })?;

        let active = self.inner.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_writes.fetch_max(active, Ordering::SeqCst);
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        let result = if fail {
            Err(BackfillError::IoFatal(format!("injected write failure on '{oid}'")))
        } else {
            self.with_ns(|ns, events| {
                if ns.objects.contains_key(oid) {
                    return Err(BackfillError::AlreadyExists(format!("object '{oid}'")));
                }
                ns.objects.insert(oid.to_string(), data.to_vec());
                events.push(ClusterEvent::Write {
                    oid: oid.to_string(),
                    len: data.len(),
                });
                Ok(())
            })
        };
        self.inner.active_writes.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.inner.writes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    fn lock_exclusive(&self, lease: &LockLease) -> Result<()> {
        self.with_ns(|ns, events| {
            if let Some(held) = ns.locks.get(&lease.object_name) {
                if lock_is_live(held) {
                    return Err(BackfillError::Busy(format!(
                        "object '{}' locked by '{}'",
                        lease.object_name, held.cookie
                    )));
                }
            }
            ns.locks.insert(
                lease.object_name.clone(),
                HeldLock {
                    cookie: lease.cookie.clone(),
                    expires: Instant::now() + lease.duration,
                },
            );
            events.push(ClusterEvent::Lock {
                oid: lease.object_name.clone(),
                cookie: lease.cookie.clone(),
            });
            Ok(())
        })
    }

    fn unlock(&self, lease: &LockLease) -> Result<()> {
        if self.inner.faults.lock().unwrap().fail_unlock {
            return Err(BackfillError::IoTransient("injected unlock failure".into()));
        }
        self.with_ns(|ns, events| match ns.locks.get(&lease.object_name) {
            Some(held) if held.cookie == lease.cookie => {
                ns.locks.remove(&lease.object_name);
                events.push(ClusterEvent::Unlock {
                    oid: lease.object_name.clone(),
                    cookie: lease.cookie.clone(),
                });
                Ok(())
            }
            _ => Err(BackfillError::NotFound(format!(
                "lock on '{}' with cookie '{}'",
                lease.object_name, lease.cookie
            ))),
        })
    }

    fn watch(&self, oid: &str, callback: WatchCallback) -> Result<u64> {
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::SeqCst);
        self.inner.watchers.lock().unwrap().insert(
            id,
            Watcher {
                pool_id: self.pool_id,
                namespace: self.namespace.clone(),
                oid: oid.to_string(),
                callback,
            },
        );
        self.with_ns(|_, events| {
            events.push(ClusterEvent::Watch {
                oid: oid.to_string(),
            });
            Ok(id)
        })
    }

    fn unwatch(&self, watch_id: u64) -> Result<()> {
        let removed = self.inner.watchers.lock().unwrap().remove(&watch_id);
        match removed {
            Some(w) => self.with_ns(|_, events| {
                events.push(ClusterEvent::Unwatch { oid: w.oid });
                Ok(())
            }),
            None => Err(BackfillError::NotFound(format!("watch {watch_id}"))),
        }
    }

    fn notify(&self, oid: &str) -> Result<usize> {
        let callbacks: Vec<WatchCallback> = self
            .inner
            .watchers
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.pool_id == self.pool_id && w.namespace == self.namespace && w.oid == oid)
            .map(|w| Arc::clone(&w.callback))
            .collect();
        for cb in &callbacks {
            cb();
        }
        Ok(callbacks.len())
    }

    fn object_map_get(&self, image_id: &str, object_no: u64) -> Result<ObjectState> {
        self.with_image(image_id, |img, _| {
            Ok(img
                .object_map
                .get(&object_no)
                .copied()
                .unwrap_or(ObjectState::Nonexistent))
        })
    }

    fn object_map_set(&self, image_id: &str, object_no: u64, state: ObjectState) -> Result<()> {
        self.with_image(image_id, |img, events| {
            img.object_map.insert(object_no, state);
            events.push(ClusterEvent::MapSet {
                image_id: image_id.to_string(),
                object_no,
            });
            Ok(())
        })
    }
}

// --- Connector ---

#[derive(Default)]
struct ConnectorState {
    clusters: HashMap<String, (MemoryCluster, Option<String>)>,
    conf_log: HashMap<String, BTreeMap<String, String>>,
    fail_conf_key: Option<String>,
    connects: usize,
    aborted: usize,
}

/// Hands out [`MemoryCluster`]s by cluster name, checking the key each was
/// registered with.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `cluster` reachable under `name`; `key` is the secret a client must present.
    pub fn register(&self, name: &str, cluster: MemoryCluster, key: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .clusters
            .insert(name.to_string(), (cluster, key.map(str::to_string)));
    }

    /// Make `conf_set` fail for this key.
    pub fn fail_conf_key(&self, key: Option<&str>) {
        self.state.lock().unwrap().fail_conf_key = key.map(str::to_string);
    }

    /// Configuration applied by the most recent connect attempt to `name`.
    pub fn applied_conf(&self, name: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .conf_log
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Pending handles torn down without connecting.
    pub fn aborted_count(&self) -> usize {
        self.state.lock().unwrap().aborted
    }
}

impl ClusterConnector for MemoryConnector {
    fn create(&self, cluster_name: &str, _client_name: &str) -> Result<Box<dyn PendingCluster>> {
        Ok(Box::new(PendingMemoryCluster {
            state: Arc::clone(&self.state),
            cluster_name: cluster_name.to_string(),
            conf: BTreeMap::new(),
        }))
    }
}

struct PendingMemoryCluster {
    state: Arc<Mutex<ConnectorState>>,
    cluster_name: String,
    conf: BTreeMap<String, String>,
}

impl PendingCluster for PendingMemoryCluster {
    fn conf_set(&mut self, key: &str, value: &str) -> Result<()> {
        let st = self.state.lock().unwrap();
        if st.fail_conf_key.as_deref() == Some(key) {
            return Err(BackfillError::InvalidArgument(format!(
                "rejected config option '{key}'"
            )));
        }
        self.conf.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn connect(&mut self) -> Result<Arc<dyn Cluster>> {
        let mut st = self.state.lock().unwrap();
        st.conf_log
            .insert(self.cluster_name.clone(), self.conf.clone());
        if self.conf.get("mon_host").is_none_or(|v| v.is_empty()) {
            return Err(BackfillError::InvalidArgument("mon_host is not set".into()));
        }
        let (cluster, key) = st
            .clusters
            .get(&self.cluster_name)
            .cloned()
            .ok_or_else(|| {
                BackfillError::IoTransient(format!("cluster '{}' unreachable", self.cluster_name))
            })?;
        if let Some(expected) = key {
            if self.conf.get("key") != Some(&expected) {
                return Err(BackfillError::Forbidden(format!(
                    "authentication to '{}' failed",
                    self.cluster_name
                )));
            }
        }
        st.connects += 1;
        Ok(Arc::new(cluster))
    }

    fn shutdown(self: Box<Self>) {
        self.state.lock().unwrap().aborted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(oid: &str, cookie: &str) -> LockLease {
        LockLease::backfill(oid, cookie.to_string(), Duration::from_secs(30))
    }

    #[test]
    fn write_requires_lock() {
        let c = MemoryCluster::new("ceph");
        c.create_pool("rbd");
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        let l = lease("obj", "me");
        let err = io.write_full_exclusive("obj", b"data", &l).unwrap_err();
        assert!(err.is_busy());

        io.lock_exclusive(&l).unwrap();
        io.write_full_exclusive("obj", b"data", &l).unwrap();
        assert_eq!(c.object("rbd", "", "obj").unwrap(), b"data");
    }

    #[test]
    fn exclusive_create_does_not_overwrite() {
        let c = MemoryCluster::new("ceph");
        c.put_object("rbd", "", "obj", b"client");
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        let l = lease("obj", "me");
        io.lock_exclusive(&l).unwrap();
        let err = io.write_full_exclusive("obj", b"parent", &l).unwrap_err();
        assert!(matches!(err, BackfillError::AlreadyExists(_)));
        assert_eq!(c.object("rbd", "", "obj").unwrap(), b"client");
    }

    #[test]
    fn lock_contention_and_expiry() {
        let c = MemoryCluster::new("ceph");
        c.create_pool("rbd");
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        c.hold_lock("rbd", "", "obj", "client", Duration::from_secs(30));
        assert!(io.lock_exclusive(&lease("obj", "me")).unwrap_err().is_busy());

        c.hold_lock("rbd", "", "obj", "client", Duration::ZERO);
        io.lock_exclusive(&lease("obj", "me")).unwrap();
        assert_eq!(c.lock_holder("rbd", "", "obj").as_deref(), Some("me"));
    }

    #[test]
    fn unlock_requires_matching_cookie() {
        let c = MemoryCluster::new("ceph");
        c.create_pool("rbd");
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        io.lock_exclusive(&lease("obj", "me")).unwrap();
        assert!(io.unlock(&lease("obj", "other")).unwrap_err().is_not_found());
        io.unlock(&lease("obj", "me")).unwrap();
        assert_eq!(c.held_lock_count(), 0);
    }

    #[test]
    fn namespaces_are_isolated() {
        let c = MemoryCluster::new("ceph");
        c.put_object("rbd", "a", "obj", b"in-a");
        let io_b = c.io_ctx(&PoolRef::Name("rbd".into()), "b").unwrap();
        assert!(io_b.read("obj", 0, 4, None).unwrap_err().is_not_found());
        let io_a = c.io_ctx(&PoolRef::Name("rbd".into()), "a").unwrap();
        assert_eq!(io_a.read("obj", 0, 4, None).unwrap(), b"in-a");
    }

    #[test]
    fn snapshot_reads_see_frozen_data() {
        let c = MemoryCluster::new("ceph");
        let info = c.create_image("rbd", "", "parent", 8, 4);
        let oid = backfill_types::object::object_name(&info.object_prefix, 0);
        c.put_object("rbd", "", &oid, b"old!");
        c.create_snapshot("rbd", "", &info.id, 7);
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        // Head is replaced out from under the snapshot.
        c.put_object("rbd", "", &oid, b"new!");
        assert_eq!(io.read(&oid, 0, 4, Some(7)).unwrap(), b"old!");
        assert_eq!(io.read(&oid, 0, 4, None).unwrap(), b"new!");
    }

    #[test]
    fn notify_reaches_watchers_on_same_object() {
        let c = MemoryCluster::new("ceph");
        c.create_pool("rbd");
        let io = c.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = io
            .watch("obj", Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(io.notify("other").unwrap(), 0);
        assert_eq!(io.notify("obj").unwrap(), 1);
        io.unwatch(id).unwrap();
        assert_eq!(io.notify("obj").unwrap(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connector_checks_key_and_records_conf() {
        let connector = MemoryConnector::new();
        connector.register("backup", MemoryCluster::new("backup"), Some("c2VjcmV0"));

        let mut pending = connector.create("backup", "client.admin").unwrap();
        pending.conf_set("mon_host", "10.0.0.1:6789").unwrap();
        pending.conf_set("key", "wrong").unwrap();
        assert!(matches!(
            pending.connect(),
            Err(BackfillError::Forbidden(_))
        ));
        pending.shutdown();
        assert_eq!(connector.aborted_count(), 1);

        let mut pending = connector.create("backup", "client.admin").unwrap();
        pending.conf_set("mon_host", "10.0.0.1:6789").unwrap();
        pending.conf_set("key", "c2VjcmV0").unwrap();
        let cluster = pending.connect().unwrap();
        assert_eq!(cluster.name(), "backup");
        assert_eq!(
            connector.applied_conf("backup").get("mon_host").map(String::as_str),
            Some("10.0.0.1:6789")
        );
    }
}
