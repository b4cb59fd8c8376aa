use std::sync::Arc;

use backfill_types::error::{BackfillError, Result};
use backfill_types::object;

use super::{ParentReader, ReadCallback};
use crate::cluster::{ImageInfo, IoCtx};
use crate::remote::RemoteHandle;

/// Reads child ranges from a parent image, which may use a different object
/// size than the child. Missing parent objects read as zeros.
#[derive(Clone)]
pub struct ImageParentReader {
    inner: Arc<Inner>,
}

struct Inner {
    io: Arc<dyn IoCtx>,
    parent: ImageInfo,
    snap_id: Option<u64>,
    child_object_size: u64,
    overlap: u64,
    // Keeps a remote connection open for as long as the reader lives.
    _remote: Option<RemoteHandle>,
}

impl ImageParentReader {
    pub fn open(
        io: Arc<dyn IoCtx>,
        image_id: &str,
        snap_id: Option<u64>,
        child_object_size: u64,
        overlap: u64,
        remote: Option<RemoteHandle>,
    ) -> Result<Self> {
        let parent = io.image_info(image_id)?;
        if parent.object_size == 0 || child_object_size == 0 {
            return Err(BackfillError::InvalidArgument(format!(
                "parent image '{image_id}' has zero object size"
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                io,
                parent,
                snap_id,
                child_object_size,
                overlap,
                _remote: remote,
            }),
        })
    }

    pub fn parent_info(&self) -> &ImageInfo {
        &self.inner.parent
    }
}

impl Inner {
    fn read(&self, object_no: u64, object_offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = object::absolute_offset(object_no, self.child_object_size, object_offset)
            .ok_or_else(|| range_overflow(object_no, object_offset, length))?;
        let end = start
            .checked_add(length)
            .ok_or_else(|| range_overflow(object_no, object_offset, length))?;
        let len = usize::try_from(length)
            .map_err(|_| range_overflow(object_no, object_offset, length))?;

        let osz = self.parent.object_size;
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        while pos < end {
            let parent_no = pos / osz;
            let within = pos % osz;
            let chunk = (osz - within).min(end - pos);
            let oid = object::object_name(&self.parent.object_prefix, parent_no);
            let data = match self.io.read(&oid, within, chunk, self.snap_id) {
                Ok(d) => d,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e),
            };
            let before = out.len();
            out.extend_from_slice(&data);
            // Short objects are sparse at the tail.
            out.resize(before + chunk as usize, 0);
            pos += chunk;
        }
        Ok(out)
    }
}

fn range_overflow(object_no: u64, offset: u64, length: u64) -> BackfillError {
    BackfillError::InvalidArgument(format!(
        "range {offset}+{length} of object {object_no} overflows"
    ))
}

impl ParentReader for ImageParentReader {
    fn overlap(&self) -> u64 {
        self.inner.overlap
    }

    fn read(&self, object_no: u64, object_offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner.read(object_no, object_offset, length)
    }

    fn read_async(&self, object_no: u64, object_offset: u64, length: u64, on_done: ReadCallback) {
        let inner = Arc::clone(&self.inner);
        crate::detach::detach(
            "parent-read",
            move || inner.read(object_no, object_offset, length),
            on_done,
            |e| Err(BackfillError::from(e)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::{Cluster, PoolRef};

    fn parent_with_objects(cluster: &MemoryCluster, object_size: u64) -> ImageInfo {
        let info = cluster.create_image("rbd", "", "parent", 4 * object_size, object_size);
        for no in [0u64, 2] {
            let oid = object::object_name(&info.object_prefix, no);
            cluster.put_object("rbd", "", &oid, &vec![b'a' + no as u8; object_size as usize]);
        }
        info
    }

    fn reader(cluster: &MemoryCluster, info: &ImageInfo, child_osz: u64, snap: Option<u64>) -> ImageParentReader {
        let io = cluster.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        ImageParentReader::open(io, &info.id, snap, child_osz, info.size, None).unwrap()
    }

    #[test]
    fn same_layout_reads_object_and_sparse_zeros() {
        let cluster = MemoryCluster::new("ceph");
        let info = parent_with_objects(&cluster, 8);
        let r = reader(&cluster, &info, 8, None);
        assert_eq!(r.read(0, 0, 8).unwrap(), vec![b'a'; 8]);
        assert_eq!(r.read(1, 0, 8).unwrap(), vec![0; 8]);
        assert_eq!(r.read(2, 2, 3).unwrap(), vec![b'c'; 3]);
        assert_eq!(r.overlap(), 32);
    }

    #[test]
    fn larger_child_objects_span_parent_objects() {
        let cluster = MemoryCluster::new("ceph");
        let info = parent_with_objects(&cluster, 8);
        let r = reader(&cluster, &info, 16, None);
        let data = r.read(0, 4, 8).unwrap();
        assert_eq!(&data[..4], &[b'a'; 4]);
        assert_eq!(&data[4..], &[0; 4]);
        let data = r.read(1, 0, 16).unwrap();
        assert_eq!(&data[..8], &[b'c'; 8]);
        assert_eq!(&data[8..], &[0; 8]);
    }

    #[test]
    fn snapshot_reads_frozen_data() {
        let cluster = MemoryCluster::new("ceph");
        let info = parent_with_objects(&cluster, 8);
        cluster.create_snapshot("rbd", "", &info.id, 7);
        let oid = object::object_name(&info.object_prefix, 1);
        cluster.put_object("rbd", "", &oid, &[b'z'; 8]);

        let snap = reader(&cluster, &info, 8, Some(7));
        assert_eq!(snap.read(1, 0, 8).unwrap(), vec![0; 8]);
        let live = reader(&cluster, &info, 8, None);
        assert_eq!(live.read(1, 0, 8).unwrap(), vec![b'z'; 8]);
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let cluster = MemoryCluster::new("ceph");
        let info = parent_with_objects(&cluster, 8);
        let r = reader(&cluster, &info, 8, None);
        let err = r.read(u64::MAX, 0, 8).unwrap_err();
        assert!(matches!(err, BackfillError::InvalidArgument(_)));
    }

    #[test]
    fn async_read_delivers_result() {
        let cluster = MemoryCluster::new("ceph");
        let info = parent_with_objects(&cluster, 8);
        let r = reader(&cluster, &info, 8, None);
        let (tx, rx) = mpsc::channel();
        r.read_async(2, 0, 4, Box::new(move |res| tx.send(res).unwrap()));
        let got = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(got.unwrap(), vec![b'c'; 4]);
    }

    #[test]
    fn missing_parent_image_fails_open() {
        let cluster = MemoryCluster::new("ceph");
        cluster.create_pool("rbd");
        let io = cluster.io_ctx(&PoolRef::Name("rbd".into()), "").unwrap();
        assert!(ImageParentReader::open(io, "dead", None, 8, 8, None).is_err());
    }
}
