use std::sync::Arc;
use std::time::Duration;

use backfill_types::image_spec::ImageSpec;
use backfill_types::object::object_name;

use crate::cluster::memory::MemoryCluster;
use crate::cluster::{Cluster, ImageInfo, ParentLink};
use crate::config::{BackfillConfig, ClusterConfig, EngineConfig, S3ClientConfig};
use crate::engine::{BackfillThrottler, ImageBackfiller, RequestSettings, WorkQueue};
use crate::image::ImageHandle;
use crate::metadata::KEY_SCHEDULED;
use crate::parent::ParentReader;

pub const POOL: &str = "rbd";

/// Deterministic, position-dependent bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn open(cluster: &MemoryCluster, name: &str) -> Arc<ImageHandle> {
    ImageHandle::open(cluster, &ImageSpec::new(POOL, "", name)).unwrap()
}

pub fn schedule(cluster: &MemoryCluster, info: &ImageInfo) {
    cluster.set_metadata(POOL, "", &info.id, KEY_SCHEDULED, "true");
}

/// A child image backed by an S3 object at `endpoint`, marked for backfill.
pub fn s3_child(cluster: &MemoryCluster, name: &str, size: u64, object_size: u64, endpoint: &str) -> ImageInfo {
    let info = cluster.create_image(POOL, "", name, size, object_size);
    for (k, v) in [
        ("s3.enabled", "true"),
        ("s3.bucket", "b"),
        ("s3.endpoint", endpoint),
        ("s3.image_name", "k"),
        ("s3.image_format", "raw"),
        ("s3.max_retries", "3"),
    ] {
        cluster.set_metadata(POOL, "", &info.id, k, v);
    }
    schedule(cluster, &info);
    info
}

/// A fully populated standalone parent and a scheduled child linked to it.
/// Returns `(parent, child)`.
pub fn standalone_pair(
    cluster: &MemoryCluster,
    name: &str,
    size: u64,
    object_size: u64,
) -> (ImageInfo, ImageInfo) {
    let parent = cluster.create_image(POOL, "", &format!("{name}-parent"), size, object_size);
    let mut offset = 0;
    let mut no = 0;
    while offset < size {
        let len = object_size.min(size - offset) as usize;
        cluster.put_object(POOL, "", &object_name(&parent.object_prefix, no), &pattern(len, no as u8));
        offset += object_size;
        no += 1;
    }
    let child = cluster.create_image(POOL, "", name, size, object_size);
    let pool_id = cluster.pool_id(POOL).unwrap();
    cluster.set_parent(
        POOL,
        "",
        &child.id,
        ParentLink {
            pool_id,
            pool_name: Some(POOL.into()),
            namespace: String::new(),
            image_id: parent.id.clone(),
            snap_id: None,
            overlap: size,
        },
    );
    schedule(cluster, &child);
    (parent, child)
}

pub fn engine(max_concurrent: usize, threads: usize) -> (Arc<WorkQueue>, Arc<BackfillThrottler>) {
    let wq = WorkQueue::new(threads).unwrap();
    let throttler = Arc::new(BackfillThrottler::new(max_concurrent, Arc::clone(&wq)));
    (wq, throttler)
}

pub fn backfiller(
    image: Arc<ImageHandle>,
    parent: Option<Arc<dyn ParentReader>>,
    engine: &(Arc<WorkQueue>, Arc<BackfillThrottler>),
) -> ImageBackfiller {
    ImageBackfiller::new(
        image,
        parent,
        Arc::clone(&engine.1),
        Arc::clone(&engine.0),
        RequestSettings::default(),
    )
}

pub fn s3_client() -> S3ClientConfig {
    S3ClientConfig {
        retry_delay_ms: 5,
        ..S3ClientConfig::default()
    }
}

pub fn daemon_config(max_concurrent: usize) -> BackfillConfig {
    BackfillConfig {
        cluster: ClusterConfig {
            name: "ceph".into(),
            path: "/unused".into(),
            client_name: "client.admin".into(),
            options: Default::default(),
        },
        remote_clusters: Vec::new(),
        pools: Vec::new(),
        images: Vec::new(),
        backfill: EngineConfig {
            max_concurrent,
            worker_threads: 4,
            discovery_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        },
        s3: s3_client(),
        log: Default::default(),
    }
}

/// Poll `cond` for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
