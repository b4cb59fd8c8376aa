use std::sync::Arc;

use tracing::debug;

use backfill_types::error::{BackfillError, Result};

use super::{ParentReader, ReadCallback};
use crate::config::S3ClientConfig;
use crate::s3::{FetchReply, FetchStats, HttpRangeFetcher, S3Config};

/// Reads child objects out of one raw image object in S3. Child object `n`
/// starts at byte `n * object_size` of the S3 object.
pub struct S3ParentReader {
    fetcher: HttpRangeFetcher,
    url: Arc<str>,
    object_size: u64,
    overlap: u64,
}

impl S3ParentReader {
    pub fn open(config: S3Config, client: &S3ClientConfig, overlap: u64) -> Result<Self> {
        if !config.is_valid() {
            return Err(BackfillError::InvalidArgument(format!(
                "invalid s3 parent configuration for bucket '{}'",
                config.bucket
            )));
        }
        if config.object_size == 0 {
            return Err(BackfillError::InvalidArgument("s3 parent object size is zero".into()));
        }
        let fetcher = HttpRangeFetcher::for_config(&config, client)?;
        let url: Arc<str> = config.object_url().into();
        debug!(url = %url, anonymous = config.is_anonymous(), "s3 parent ready");
        Ok(Self {
            fetcher,
            url,
            object_size: config.object_size,
            overlap,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Absolute byte range in the S3 object.
    fn absolute_range(&self, object_no: u64, object_offset: u64, length: u64) -> Result<u64> {
        let start = u128::from(object_no) * u128::from(self.object_size) + u128::from(object_offset);
        let end = start + u128::from(length);
        if end > u128::from(u64::MAX) {
            return Err(BackfillError::InvalidArgument(format!(
                "range {object_offset}+{length} of object {object_no} overflows"
            )));
        }
        Ok(start as u64)
    }
}

/// Cut `[start, start + length)` out of a whole-object reply.
fn slice_whole(mut data: Vec<u8>, start: u64, length: u64) -> Vec<u8> {
    let begin = usize::try_from(start).unwrap_or(usize::MAX).min(data.len());
    let end = usize::try_from(start.saturating_add(length))
        .unwrap_or(usize::MAX)
        .min(data.len());
    data.truncate(end);
    data.drain(..begin);
    data
}

impl ParentReader for S3ParentReader {
    fn overlap(&self) -> u64 {
        self.overlap
    }

    fn read(&self, object_no: u64, object_offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = self.absolute_range(object_no, object_offset, length)?;
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut buf = Vec::new();
        match self.fetcher.fetch(&self.url, start, length, &mut buf)? {
            FetchReply::Partial => Ok(buf),
            FetchReply::Whole => Ok(slice_whole(buf, start, length)),
        }
    }

    fn read_async(&self, object_no: u64, object_offset: u64, length: u64, on_done: ReadCallback) {
        let start = match self.absolute_range(object_no, object_offset, length) {
            Ok(s) => s,
            Err(e) => return on_done(Err(e)),
        };
        if length == 0 {
            return on_done(Ok(Vec::new()));
        }
        self.fetcher
            .fetch_async(self.url.to_string(), start, length, move |res| {
                on_done(
                    res.map(|(buf, reply)| match reply {
                        FetchReply::Partial => buf,
                        FetchReply::Whole => slice_whole(buf, start, length),
                    })
                    .map_err(BackfillError::from),
                );
            });
    }

    fn fetch_stats(&self) -> Option<FetchStats> {
        Some(self.fetcher.stats())
    }
}
