pub(crate) mod config;
pub(crate) mod run;
pub(crate) mod status;

use std::sync::Arc;

use backfill_core::cluster::directory::{DirCluster, DirConnector};
use backfill_core::config::BackfillConfig;
use backfill_types::error::Result;

/// Open the local directory cluster named in the config.
pub(crate) fn open_cluster(config: &BackfillConfig) -> Result<Arc<DirCluster>> {
    let options = config
        .cluster
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let cluster = DirCluster::open(
        &config.cluster.name,
        std::path::Path::new(&config.cluster.path),
        options,
    )?;
    Ok(Arc::new(cluster))
}

/// A connector that knows every remote cluster with a configured path.
pub(crate) fn connector(config: &BackfillConfig) -> DirConnector {
    config
        .remote_clusters
        .iter()
        .filter_map(|r| r.path.as_deref().map(|p| (r.name.as_str(), p)))
        .fold(DirConnector::new(), |c, (name, path)| {
            c.with_cluster(name, std::path::Path::new(path))
        })
}
