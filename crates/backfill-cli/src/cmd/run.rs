use std::sync::Arc;

use backfill_core::config::BackfillConfig;
use backfill_core::engine::BackfillDaemon;
use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;

use crate::signal::SHUTDOWN;

pub(crate) fn parse_images(images: &[String]) -> Result<Vec<ImageSpec>> {
    images
        .iter()
        .map(|s| {
            s.parse::<ImageSpec>()
                .map_err(|e| BackfillError::InvalidArgument(format!("--image '{s}': {e}")))
        })
        .collect()
}

/// Run the daemon until [`SHUTDOWN`] is set. Errors only when start-up fails.
pub(crate) fn run_daemon(config: BackfillConfig, images: Vec<ImageSpec>) -> Result<()> {
    let cluster = super::open_cluster(&config)?;
    let connector = Arc::new(super::connector(&config));

    tracing::info!(
        cluster = %config.cluster.name,
        path = %config.cluster.path,
        pools = ?config.pools,
        pinned = images.len(),
        max_concurrent = config.backfill.max_concurrent,
        "backfill daemon starting"
    );

    let mut daemon = BackfillDaemon::new(cluster, connector, config).with_pinned_images(images);
    daemon.init()?;
    let result = daemon.run(&SHUTDOWN);
    daemon.shutdown();
    result
}
