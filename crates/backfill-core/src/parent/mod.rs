//! Where a child image's data comes from.
//!
//! A child either has an S3-backed parent (one raw image object in a bucket)
//! or a parent image: a snapshot or a live standalone image, on the local
//! cluster or a remote one. [`resolve_parent`] opens a [`ParentReader`] for
//! whichever applies.

mod image;
mod s3;

use std::sync::Arc;

use tracing::{info, warn};

use backfill_types::error::Result;

use crate::cluster::{Cluster, PoolRef};
use crate::config::{RemoteClusterConfig, S3ClientConfig};
use crate::image::ImageHandle;
use crate::metadata;
use crate::remote::{RemoteClusterRef, RemoteClusterRegistry};
use crate::s3::{FetchStats, S3Config};

pub use self::image::ImageParentReader;
pub use self::s3::S3ParentReader;

/// Completion for [`ParentReader::read_async`].
pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// Reads ranges of a child object from its parent.
pub trait ParentReader: Send + Sync {
    /// Bytes of the child's address space backed by the parent. Callers
    /// zero-fill past it.
    fn overlap(&self) -> u64;

    /// Read `length` bytes at `object_offset` within child object
    /// `object_no`. May return fewer bytes at the end of the parent data.
    fn read(&self, object_no: u64, object_offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Like [`read`](Self::read), delivering the result on a detached thread.
    fn read_async(&self, object_no: u64, object_offset: u64, length: u64, on_done: ReadCallback);

    /// HTTP counters for S3-backed parents.
    fn fetch_stats(&self) -> Option<FetchStats> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum ParentDescriptor {
    Snapshot {
        pool_id: i64,
        namespace: String,
        image_id: String,
        snap_id: u64,
        overlap: u64,
    },
    LocalStandalone {
        pool_id: i64,
        namespace: String,
        image_id: String,
        overlap: u64,
    },
    RemoteStandalone {
        pool_name: Option<String>,
        pool_id: i64,
        namespace: String,
        image_id: String,
        overlap: u64,
        remote: RemoteClusterRef,
    },
    S3Backed {
        config: S3Config,
        overlap: u64,
    },
}

impl ParentDescriptor {
    pub fn overlap(&self) -> u64 {
        match self {
            ParentDescriptor::Snapshot { overlap, .. }
            | ParentDescriptor::LocalStandalone { overlap, .. }
            | ParentDescriptor::RemoteStandalone { overlap, .. }
            | ParentDescriptor::S3Backed { overlap, .. } => *overlap,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParentDescriptor::Snapshot { .. } => "snapshot",
            ParentDescriptor::LocalStandalone { .. } => "standalone",
            ParentDescriptor::RemoteStandalone { .. } => "remote-standalone",
            ParentDescriptor::S3Backed { .. } => "s3",
        }
    }
}

/// Work out which parent `image` has, without opening it.
///
/// A valid `s3.*` block wins over the image's parent link. An `s3.*` block
/// that is present but invalid leaves the image without a parent.
pub fn describe_parent(
    image: &ImageHandle,
    remotes: &[RemoteClusterConfig],
) -> Result<Option<ParentDescriptor>> {
    if let Some(config) = metadata::load_s3_config(image)? {
        if !config.is_valid() {
            warn!(image = %image.spec(), "s3 parent configuration is invalid; ignoring parent");
            return Ok(None);
        }
        return Ok(Some(ParentDescriptor::S3Backed {
            config,
            overlap: image.size(),
        }));
    }

    let Some(link) = image.info().parent.clone() else {
        return Ok(None);
    };
    if let Some(snap_id) = link.snap_id {
        return Ok(Some(ParentDescriptor::Snapshot {
            pool_id: link.pool_id,
            namespace: link.namespace,
            image_id: link.image_id,
            snap_id,
            overlap: link.overlap,
        }));
    }
    if let Some(remote) = metadata::load_remote_ref(image, remotes)? {
        return Ok(Some(ParentDescriptor::RemoteStandalone {
            pool_name: link.pool_name,
            pool_id: link.pool_id,
            namespace: link.namespace,
            image_id: link.image_id,
            overlap: link.overlap,
            remote,
        }));
    }
    Ok(Some(ParentDescriptor::LocalStandalone {
        pool_id: link.pool_id,
        namespace: link.namespace,
        image_id: link.image_id,
        overlap: link.overlap,
    }))
}

/// Shared inputs for opening parents.
pub struct ParentContext<'a> {
    pub cluster: &'a dyn Cluster,
    pub registry: &'a RemoteClusterRegistry,
    pub remotes: &'a [RemoteClusterConfig],
    pub s3_client: &'a S3ClientConfig,
}

/// Open a reader for `image`'s parent. `Ok(None)` when it has none.
pub fn resolve_parent(
    ctx: &ParentContext<'_>,
    image: &ImageHandle,
) -> Result<Option<Arc<dyn ParentReader>>> {
    let Some(desc) = describe_parent(image, ctx.remotes)? else {
        return Ok(None);
    };
    info!(image = %image.spec(), parent = desc.kind(), overlap = desc.overlap(), "opening parent");
    let child_object_size = image.object_size();

    let reader: Arc<dyn ParentReader> = match desc {
        ParentDescriptor::S3Backed { config, overlap } => {
            Arc::new(S3ParentReader::open(config, ctx.s3_client, overlap)?)
        }
        ParentDescriptor::Snapshot {
            pool_id,
            namespace,
            image_id,
            snap_id,
            overlap,
        } => {
            let io = ctx.cluster.io_ctx(&PoolRef::Id(pool_id), &namespace)?;
            Arc::new(ImageParentReader::open(
                io,
                &image_id,
                Some(snap_id),
                child_object_size,
                overlap,
                None,
            )?)
        }
        ParentDescriptor::LocalStandalone {
            pool_id,
            namespace,
            image_id,
            overlap,
        } => {
            let io = ctx.cluster.io_ctx(&PoolRef::Id(pool_id), &namespace)?;
            Arc::new(ImageParentReader::open(
                io,
                &image_id,
                None,
                child_object_size,
                overlap,
                None,
            )?)
        }
        ParentDescriptor::RemoteStandalone {
            pool_name,
            pool_id,
            namespace,
            image_id,
            overlap,
            remote,
        } => {
            let handle = ctx.registry.get(&remote)?;
            // Pool ids are cluster-local; prefer the name.
            let pool = match pool_name {
                Some(name) => PoolRef::Name(name),
                None => PoolRef::Id(pool_id),
            };
            let io = handle.cluster().io_ctx(&pool, &namespace)?;
            Arc::new(ImageParentReader::open(
                io,
                &image_id,
                None,
                child_object_size,
                overlap,
                Some(handle),
            )?)
        }
    };
    Ok(Some(reader))
}
