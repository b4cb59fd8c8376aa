//! Open image handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;
use backfill_types::object;

use crate::cluster::{Cluster, ImageInfo, IoCtx, ObjectState, PoolRef};

/// An opened image: its resolved spec, header and I/O context. Shared by
/// `Arc` between a backfiller and its in-flight requests.
pub struct ImageHandle {
    spec: ImageSpec,
    info: ImageInfo,
    io: Arc<dyn IoCtx>,
}

impl ImageHandle {
    /// Open `spec` by pool and image name.
    pub fn open(cluster: &dyn Cluster, spec: &ImageSpec) -> Result<Arc<Self>> {
        let io = cluster.io_ctx(&PoolRef::Name(spec.pool_name.clone()), &spec.namespace)?;
        let image_id = match &spec.image_id {
            Some(id) => id.clone(),
            None => io.image_id(&spec.image_name)?,
        };
        Self::from_io(io, &spec.image_name, &image_id)
    }

    /// Open an image by id in an existing I/O context.
    pub fn from_io(io: Arc<dyn IoCtx>, image_name: &str, image_id: &str) -> Result<Arc<Self>> {
        let info = io.image_info(image_id)?;
        if info.object_size == 0 {
            return Err(BackfillError::InvalidArgument(format!(
                "image '{image_name}' has zero object size"
            )));
        }
        let spec = ImageSpec::new(io.pool_name(), io.namespace(), image_name)
            .resolved(io.pool_id(), image_id);
        Ok(Arc::new(Self { spec, info, io }))
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn io(&self) -> &Arc<dyn IoCtx> {
        &self.io
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn object_size(&self) -> u64 {
        self.info.object_size
    }

    pub fn num_objects(&self) -> u64 {
        object::num_objects(self.info.size, self.info.object_size)
    }

    pub fn object_name(&self, object_no: u64) -> String {
        object::object_name(&self.info.object_prefix, object_no)
    }

    /// Bytes of image data held by `object_no`; `None` past the end.
    pub fn object_len(&self, object_no: u64) -> Option<u64> {
        object::object_len(self.info.size, self.info.object_size, object_no)
    }

    pub fn object_state(&self, object_no: u64) -> Result<ObjectState> {
        self.io.object_map_get(&self.info.id, object_no)
    }

    pub fn metadata_get(&self, key: &str) -> Result<Option<String>> {
        self.io.metadata_get(&self.info.id, key)
    }

    pub fn metadata_list(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.io.metadata_list(&self.info.id, prefix)
    }

    pub fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        self.io.metadata_set(&self.info.id, key, value)
    }
}
