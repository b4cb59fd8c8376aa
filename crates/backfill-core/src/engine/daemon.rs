//! Discovers scheduled images and runs one backfiller per image.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;

use super::backfiller::{BackfillProgress, ImageBackfiller};
use super::request::RequestSettings;
use super::throttler::{BackfillThrottler, ThrottlerStatus};
use super::work_queue::WorkQueue;
use crate::cluster::{Cluster, ClusterConnector, PoolRef};
use crate::config::BackfillConfig;
use crate::image::ImageHandle;
use crate::metadata;
use crate::parent::{self, ParentContext};
use crate::remote::RemoteClusterRegistry;

type NameKey = (String, String, String);

/// How often [`BackfillDaemon::run`] checks the shutdown flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub images: Vec<BackfillProgress>,
    pub throttler: Option<ThrottlerStatus>,
}

struct Runtime {
    work_queue: Arc<WorkQueue>,
    throttler: Arc<BackfillThrottler>,
    registry: Arc<RemoteClusterRegistry>,
}

pub struct BackfillDaemon {
    cluster: Arc<dyn Cluster>,
    connector: Arc<dyn ClusterConnector>,
    config: BackfillConfig,
    pinned: Vec<ImageSpec>,
    poll_interval: Duration,
    runtime: Option<Runtime>,
    discovered: Vec<Arc<ImageHandle>>,
    backfillers: BTreeMap<NameKey, ImageBackfiller>,
    shut_down: bool,
}

impl BackfillDaemon {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        connector: Arc<dyn ClusterConnector>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            cluster,
            connector,
            config,
            pinned: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            runtime: None,
            discovered: Vec::new(),
            backfillers: BTreeMap::new(),
            shut_down: false,
        }
    }

    /// Images tracked in addition to the configured ones.
    pub fn with_pinned_images(mut self, images: Vec<ImageSpec>) -> Self {
        self.pinned = images;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the worker pool, throttler and remote registry, then run the
    /// first discovery. Fails if the cluster cannot be reached.
    pub fn init(&mut self) -> Result<()> {
        let engine = &self.config.backfill;
        let work_queue = WorkQueue::new(engine.worker_threads)?;
        let throttler = Arc::new(BackfillThrottler::new(
            engine.max_concurrent,
            Arc::clone(&work_queue),
        ));
        let registry = Arc::new(RemoteClusterRegistry::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.cluster),
        )?);
        self.runtime = Some(Runtime {
            work_queue,
            throttler,
            registry,
        });

        self.discovered = self.discover()?;
        info!(
            cluster = %self.cluster.name(),
            images = self.discovered.len(),
            max_concurrent = engine.max_concurrent,
            "backfill daemon initialised"
        );
        Ok(())
    }

    /// Open every image that is marked for backfill. Only a failure to list
    /// pools is an error; per-image problems are logged and skipped.
    pub fn discover(&self) -> Result<Vec<Arc<ImageHandle>>> {
        let pools = self.cluster.list_pools()?;
        let pool_names: Vec<String> = if self.config.pools.is_empty() {
            pools.into_iter().map(|p| p.name).collect()
        } else {
            self.config.pools.clone()
        };

        let mut found: BTreeMap<NameKey, Arc<ImageHandle>> = BTreeMap::new();
        for pool in &pool_names {
            let io = match self.cluster.io_ctx(&PoolRef::Name(pool.clone()), "") {
                Ok(io) => io,
                Err(e) => {
                    warn!(pool = %pool, error = %e, "skipping pool");
                    continue;
                }
            };
            let entries = match io.list_images() {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(pool = %pool, error = %e, "failed to list images");
                    continue;
                }
            };
            for entry in entries {
                let image = match ImageHandle::from_io(Arc::clone(&io), &entry.name, &entry.id) {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(pool = %pool, image = %entry.name, error = %e, "failed to open image");
                        continue;
                    }
                };
                if self.keep_if_scheduled(&image) {
                    found.insert(image.spec().name_key(), image);
                }
            }
        }

        for spec in self.pinned_specs() {
            if found.contains_key(&spec.name_key()) {
                continue;
            }
            match ImageHandle::open(self.cluster.as_ref(), &spec) {
                Ok(image) => {
                    if self.keep_if_scheduled(&image) {
                        found.insert(image.spec().name_key(), image);
                    } else {
                        warn!(image = %spec, "pinned image is not scheduled for backfill");
                    }
                }
                Err(e) => warn!(image = %spec, error = %e, "failed to open pinned image"),
            }
        }

        debug!(images = found.len(), "discovery finished");
        Ok(found.into_values().collect())
    }

    fn pinned_specs(&self) -> Vec<ImageSpec> {
        let mut specs: Vec<ImageSpec> = self
            .config
            .images
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(spec) => Some(spec),
                Err(e) => {
                    warn!(image = %s, error = %e, "ignoring invalid image spec");
                    None
                }
            })
            .collect();
        specs.extend(self.pinned.iter().cloned());
        specs
    }

    fn keep_if_scheduled(&self, image: &ImageHandle) -> bool {
        match metadata::is_scheduled(image) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                warn!(image = %image.spec(), error = %e, "failed to read scheduling metadata");
                false
            }
        }
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| BackfillError::LogicError("backfill daemon not initialised".into()))
    }

    fn start_backfiller(&mut self, image: Arc<ImageHandle>) -> Result<()> {
        let key = image.spec().name_key();
        if self.backfillers.contains_key(&key) {
            return Ok(());
        }
        let rt = self.runtime()?;
        let ctx = ParentContext {
            cluster: self.cluster.as_ref(),
            registry: &rt.registry,
            remotes: &self.config.remote_clusters,
            s3_client: &self.config.s3,
        };
        let parent = parent::resolve_parent(&ctx, &image)?;
        let settings = RequestSettings {
            lock_duration: self.config.backfill.lock_duration(),
            preempt_on_notify: self.config.backfill.preempt_on_notify,
        };
        let backfiller = ImageBackfiller::new(
            image,
            parent,
            Arc::clone(&rt.throttler),
            Arc::clone(&rt.work_queue),
            settings,
        );
        backfiller.start()?;
        info!(image = %backfiller.spec(), "started backfiller");
        self.backfillers.insert(key, backfiller);
        Ok(())
    }

    fn start_discovered(&mut self) {
        for image in std::mem::take(&mut self.discovered) {
            let spec = image.spec().clone();
            if let Err(e) = self.start_backfiller(image) {
                warn!(image = %spec, error = %e, "failed to start backfiller");
            }
        }
    }

    /// Rerun discovery: start new images, stop those no longer scheduled.
    pub fn rediscover(&mut self) {
        let images = match self.discover() {
            Ok(images) => images,
            Err(e) => {
                warn!(error = %e, "discovery failed, keeping current images");
                return;
            }
        };
        let keep: BTreeSet<NameKey> = images.iter().map(|i| i.spec().name_key()).collect();
        let gone: Vec<NameKey> = self
            .backfillers
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        for key in gone {
            if let Some(backfiller) = self.backfillers.remove(&key) {
                info!(image = %backfiller.spec(), "image no longer scheduled, stopping backfiller");
                backfiller.stop();
            }
        }
        self.discovered = images;
        self.start_discovered();
    }

    /// Start backfillers and keep discovering until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.runtime()?;
        self.start_discovered();
        let interval = self.config.backfill.discovery_interval;
        let mut last_discovery = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(self.poll_interval);
            if !interval.is_zero() && last_discovery.elapsed() >= interval {
                self.rediscover();
                last_discovery = Instant::now();
            }
        }
        info!("shutdown requested");
        Ok(())
    }

    /// Progress of every running backfiller.
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            images: self.backfillers.values().map(|b| b.progress()).collect(),
            throttler: self.runtime.as_ref().map(|rt| rt.throttler.status()),
        }
    }

    pub fn backfiller(&self, spec: &ImageSpec) -> Option<&ImageBackfiller> {
        self.backfillers.get(&spec.name_key())
    }

    /// Stop every backfiller, drain in-flight objects, tear down the worker
    /// pool and remote connections, and disconnect. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(images = self.backfillers.len(), "shutting down backfill daemon");

        for backfiller in self.backfillers.values() {
            backfiller.request_stop();
        }
        for backfiller in self.backfillers.values() {
            backfiller.stop();
        }
        if let Some(rt) = &self.runtime {
            rt.throttler.wait_for_ops();
            rt.work_queue.stop();
        }
        self.backfillers.clear();
        self.discovered.clear();
        if let Some(rt) = self.runtime.take() {
            rt.registry.shutdown();
        }
        self.cluster.shutdown();
        info!("backfill daemon stopped");
    }
}

impl Drop for BackfillDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
