//! Object numbering for striped images.
//!
//! Object `n` covers bytes `[n * object_size, (n + 1) * object_size)` of the
//! image; the last object may be shorter.

/// Width of the hex object index in data object names.
pub const OBJECT_INDEX_WIDTH: usize = 16;

/// Data object prefix for an image id, e.g. `rbd_data.10ab2c`.
pub fn data_object_prefix(image_id: &str) -> String {
    format!("rbd_data.{image_id}")
}

/// Canonical per-object name: prefix plus zero-padded lowercase hex index.
pub fn object_name(prefix: &str, object_no: u64) -> String {
    format!("{prefix}.{object_no:0width$x}", width = OBJECT_INDEX_WIDTH)
}

/// `ceil(image_size / object_size)`; zero for an empty image.
pub fn num_objects(image_size: u64, object_size: u64) -> u64 {
    if object_size == 0 {
        return 0;
    }
    image_size.div_ceil(object_size)
}

/// Number of image bytes that live in `object_no`, or `None` when the object
/// lies past the end of the image.
pub fn object_len(image_size: u64, object_size: u64, object_no: u64) -> Option<u64> {
    let start = absolute_offset(object_no, object_size, 0)?;
    if start >= image_size {
        return None;
    }
    Some((image_size - start).min(object_size))
}

/// `object_no * object_size + offset`, or `None` on `u64` overflow.
pub fn absolute_offset(object_no: u64, object_size: u64, offset: u64) -> Option<u64> {
    let abs = u128::from(object_no) * u128::from(object_size) + u128::from(offset);
    u64::try_from(abs).ok()
}
