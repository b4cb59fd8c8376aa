//! One shared client handle per remote cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use backfill_types::error::Result;

use super::{connect, RemoteClusterRef};
use crate::cluster::{Cluster, ClusterConnector};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    cluster_name: String,
    mon_hosts: Vec<String>,
    client_name: String,
}

impl From<&RemoteClusterRef> for RegistryKey {
    fn from(r: &RemoteClusterRef) -> Self {
        Self {
            cluster_name: r.cluster_name.clone(),
            mon_hosts: r.mon_hosts.clone(),
            client_name: r.client_name.clone(),
        }
    }
}

/// `None` tells the reaper to exit.
type ReapMessage = Option<(String, Arc<dyn Cluster>)>;

struct SharedCluster {
    name: String,
    cluster: Arc<dyn Cluster>,
    reaper: Sender<ReapMessage>,
}

impl Drop for SharedCluster {
    fn drop(&mut self) {
        let cluster = Arc::clone(&self.cluster);
        if let Err(e) = self.reaper.send(Some((self.name.clone(), cluster))) {
            // Reaper already gone: shut down here.
            if let Some((name, cluster)) = e.into_inner() {
                debug!(cluster = %name, "shutting down remote cluster inline");
                cluster.shutdown();
            }
        }
    }
}

/// A reference to a shared remote cluster connection. The connection is shut
/// down once the last clone is dropped.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<SharedCluster>,
}

impl RemoteHandle {
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.shared.cluster
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// Hands out [`RemoteHandle`]s, connecting at most once per
/// (cluster, monitors, client) while any handle for it is alive.
pub struct RemoteClusterRegistry {
    connector: Arc<dyn ClusterConnector>,
    local: Arc<dyn Cluster>,
    handles: Mutex<HashMap<RegistryKey, Weak<SharedCluster>>>,
    reaper_tx: Sender<ReapMessage>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteClusterRegistry {
    pub fn new(connector: Arc<dyn ClusterConnector>, local: Arc<dyn Cluster>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reaper = std::thread::Builder::new()
            .name("remote-reaper".into())
            .spawn(move || reap(rx))?;
        Ok(Self {
            connector,
            local,
            handles: Mutex::new(HashMap::new()),
            reaper_tx: tx,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Shared handle for `remote`, connecting if no live handle exists.
    pub fn get(&self, remote: &RemoteClusterRef) -> Result<RemoteHandle> {
        let key = RegistryKey::from(remote);
        if let Some(shared) = self.lookup(&key) {
            return Ok(RemoteHandle { shared });
        }

        let cluster = connect(self.connector.as_ref(), self.local.as_ref(), remote)?;
        let fresh = Arc::new(SharedCluster {
            name: remote.cluster_name.clone(),
            cluster,
            reaper: self.reaper_tx.clone(),
        });

        let mut handles = self.handles.lock().unwrap();
        if let Some(existing) = handles.get(&key).and_then(Weak::upgrade) {
            // Lost a connect race; `fresh` is reaped on drop.
            return Ok(RemoteHandle { shared: existing });
        }
        handles.retain(|_, w| w.strong_count() > 0);
        handles.insert(key, Arc::downgrade(&fresh));
        Ok(RemoteHandle { shared: fresh })
    }

    fn lookup(&self, key: &RegistryKey) -> Option<Arc<SharedCluster>> {
        self.handles.lock().unwrap().get(key).and_then(Weak::upgrade)
    }

    /// Remote connections with at least one live handle.
    pub fn live_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Stop the reaper after it drains what is queued. Handles dropped later
    /// shut their cluster down on the dropping thread.
    pub fn shutdown(&self) {
        let Some(reaper) = self.reaper.lock().unwrap().take() else {
            return;
        };
        let _ = self.reaper_tx.send(None);
        if reaper.join().is_err() {
            warn!("remote reaper thread panicked");
        }
    }
}

impl Drop for RemoteClusterRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reap(rx: Receiver<ReapMessage>) {
    while let Ok(Some((name, cluster))) = rx.recv() {
        debug!(cluster = %name, "shutting down remote cluster");
        cluster.shutdown();
    }
}
